//! Messaging codec (spec §4.10): the wire format shared by master and
//! worker. A message is a fixed 7-int header followed by the concatenated
//! per-task buffers of every `sync` schema, in schema declaration order.

use std::collections::HashMap;

use mech_types::{MechError, Schema, Task};

/// Number of `i32` header fields (spec §4.10: `header[7]`).
pub const HEADER_LEN: usize = 7;

/// Message tag (spec §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Seeds a worker with a cell to compute.
    Data,
    /// Carries config options during bootstrap.
    Standby,
    /// Returns a finished cell.
    Result,
    /// Returns an in-progress snapshot (reserved for user extension).
    Checkpoint,
    /// Empty body; tells a worker to exit.
    Terminate,
}

impl Tag {
    fn as_i32(self) -> i32 {
        match self {
            Tag::Data => 0,
            Tag::Standby => 1,
            Tag::Result => 2,
            Tag::Checkpoint => 3,
            Tag::Terminate => 4,
        }
    }

    fn from_i32(v: i32) -> Result<Self, MechError> {
        match v {
            0 => Ok(Tag::Data),
            1 => Ok(Tag::Standby),
            2 => Ok(Tag::Result),
            3 => Ok(Tag::Checkpoint),
            4 => Ok(Tag::Terminate),
            other => Err(MechError::Transport(format!("unknown wire tag {other}"))),
        }
    }
}

/// The fixed 7-field message header (spec §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: Tag,
    pub tid: i32,
    pub status: i32,
    pub loc: [i32; 3],
    pub cid: i32,
}

impl Header {
    fn to_fields(self) -> [i32; HEADER_LEN] {
        [
            self.tag.as_i32(),
            self.tid,
            self.status,
            self.loc[0],
            self.loc[1],
            self.loc[2],
            self.cid,
        ]
    }

    fn from_fields(fields: [i32; HEADER_LEN]) -> Result<Self, MechError> {
        Ok(Header {
            tag: Tag::from_i32(fields[0])?,
            tid: fields[1],
            status: fields[2],
            loc: [fields[3], fields[4], fields[5]],
            cid: fields[6],
        })
    }
}

/// Packs a header plus, for every `sync` schema (in declaration order), the
/// task's per-task buffer for that schema. `Tag::Terminate` always packs an
/// empty body regardless of `schemas` (spec §4.10).
pub fn pack(header: Header, task: &Task, schemas: &[Schema]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN * 4);
    for field in header.to_fields() {
        out.extend_from_slice(&field.to_le_bytes());
    }
    if matches!(header.tag, Tag::Terminate) {
        return out;
    }
    for schema in schemas.iter().filter(|s| s.sync) {
        if let Some(buf) = task.storage.get(&schema.name) {
            out.extend_from_slice(buf);
        } else {
            out.extend(std::iter::repeat(0u8).take(schema.storage_size()));
        }
    }
    out
}

/// Inverse of [`pack`]: splits the body back into one buffer per `sync`
/// schema, in the same declaration order used to pack it.
pub fn unpack(
    bytes: &[u8],
    schemas: &[Schema],
) -> Result<(Header, HashMap<String, Vec<u8>>), MechError> {
    if bytes.len() < HEADER_LEN * 4 {
        return Err(MechError::Transport(format!(
            "message too short for header: {} bytes",
            bytes.len()
        )));
    }
    let mut fields = [0i32; HEADER_LEN];
    for (i, field) in fields.iter_mut().enumerate() {
        let start = i * 4;
        *field = i32::from_le_bytes(bytes[start..start + 4].try_into().unwrap());
    }
    let header = Header::from_fields(fields)?;
    let mut storage = HashMap::new();
    if !matches!(header.tag, Tag::Terminate) {
        let mut cursor = HEADER_LEN * 4;
        for schema in schemas.iter().filter(|s| s.sync) {
            let len = schema.storage_size();
            if cursor + len > bytes.len() {
                return Err(MechError::Transport(format!(
                    "message body truncated for schema '{}': need {len} bytes at offset {cursor}, have {}",
                    schema.name,
                    bytes.len()
                )));
            }
            storage.insert(schema.name.clone(), bytes[cursor..cursor + len].to_vec());
            cursor += len;
        }
    }
    Ok((header, storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mech_types::{Datatype, HdfVisibility, StorageDiscipline};

    fn list_schema(name: &str, dims: Vec<usize>, sync: bool) -> Schema {
        Schema {
            name: name.to_string(),
            rank: dims.len(),
            dims,
            datatype: Datatype::Int,
            storage_type: StorageDiscipline::List,
            sync,
            use_hdf: HdfVisibility::Normal,
        }
    }

    #[test]
    fn round_trips_header_and_synced_buffers() {
        let schemas = vec![list_schema("result", vec![3, 1], true)];
        let mut task = Task::new(0, 2);
        task.storage
            .insert("result".into(), vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);

        let header = Header {
            tag: Tag::Result,
            tid: 2,
            status: 1,
            loc: [1, 0, 0],
            cid: 7,
        };
        let wire = pack(header, &task, &schemas);
        let (decoded_header, body) = unpack(&wire, &schemas).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(body.get("result").unwrap(), task.storage.get("result").unwrap());
    }

    #[test]
    fn unsynced_schema_is_not_packed() {
        let schemas = vec![list_schema("scratch", vec![1, 1], false)];
        let task = Task::new(0, 0);
        let header = Header {
            tag: Tag::Data,
            tid: 0,
            status: 0,
            loc: [0, 0, 0],
            cid: 0,
        };
        let wire = pack(header, &task, &schemas);
        assert_eq!(wire.len(), HEADER_LEN * 4);
    }

    #[test]
    fn terminate_body_is_always_empty() {
        let schemas = vec![list_schema("result", vec![3, 1], true)];
        let task = Task::new(0, 0);
        let header = Header {
            tag: Tag::Terminate,
            tid: 0,
            status: 0,
            loc: [0, 0, 0],
            cid: 0,
        };
        let wire = pack(header, &task, &schemas);
        assert_eq!(wire.len(), HEADER_LEN * 4);
        let (decoded, body) = unpack(&wire, &schemas).unwrap();
        assert_eq!(decoded.tag, Tag::Terminate);
        assert!(body.is_empty());
    }

    #[test]
    fn truncated_message_is_rejected() {
        let schemas = vec![list_schema("result", vec![3, 1], true)];
        let short = vec![0u8; HEADER_LEN * 4 - 1];
        assert!(unpack(&short, &schemas).is_err());
    }
}
