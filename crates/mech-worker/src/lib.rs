//! Worker loop (spec §4.7): receive a task, run the user module's
//! `TaskProcess`, pack and send the result back, repeat until `Terminate`.
//!
//! Grounded on `core-actions::dispatcher`'s receive/react/reply shape,
//! mirrored from the other side of the channel from `mech-master::dispatch`.

use mech_codec::{pack, unpack, Header, Tag};
use mech_module::ModuleRegistry;
use mech_transport::Transport;
use mech_types::{MechError, Pool, Task};
use tracing::trace;

/// Runs one worker rank's loop against `pool`'s already-declared schema
/// (spec §6.3 `Storage`, called once per pool on every node before this
/// loop starts). Blocks on `recv` until a `Terminate` message arrives or
/// the transport itself fails.
pub fn run<T: Transport>(
    transport: &T,
    registry: &ModuleRegistry,
    pool: &Pool,
) -> Result<(), MechError> {
    loop {
        let (source, _tag, payload) = transport.recv(None)?;
        let (header, storage) = unpack(&payload, &pool.task_schema)?;

        if matches!(header.tag, Tag::Terminate) {
            trace!(target: "worker", rank = transport.rank(), "terminated");
            return Ok(());
        }

        let mut task = Task::new(pool.pid, header.tid as usize);
        task.location = [
            header.loc[0] as usize,
            header.loc[1] as usize,
            header.loc[2] as usize,
        ];
        task.cid = header.cid as u64;
        task.node = transport.rank();
        task.storage = storage;

        registry
            .module
            .task_process(pool, &mut task)
            .map_err(|e| MechError::Module(e.0))?;

        let reply = Header {
            tag: Tag::Result,
            tid: header.tid,
            status: 1,
            loc: header.loc,
            cid: task.cid as i32,
        };
        let wire = pack(reply, &task, &pool.task_schema);
        transport.send(source, Tag::Result, &wire)?;
        trace!(target: "worker", rank = transport.rank(), tid = header.tid, "result_sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mech_module::{ModuleError, UserModule};
    use mech_transport::ThreadTransport;
    use mech_types::{Datatype, HdfVisibility, Schema, StorageDiscipline};
    use std::thread;

    struct DoubleModule;
    impl UserModule for DoubleModule {
        fn storage(&self, pool: &mut Pool) {
            pool.task_schema.push(Schema {
                name: "value".into(),
                rank: 2,
                dims: vec![1, 1],
                datatype: Datatype::Int,
                storage_type: StorageDiscipline::List,
                sync: true,
                use_hdf: HdfVisibility::Normal,
            });
        }

        fn task_process(&self, _p: &Pool, t: &mut Task) -> Result<(), ModuleError> {
            let bytes = t.storage.get_mut("value").unwrap();
            let n = i32::from_le_bytes(bytes[..4].try_into().unwrap());
            bytes[..4].copy_from_slice(&(n * 2).to_le_bytes());
            Ok(())
        }
    }

    struct FailingModule;
    impl UserModule for FailingModule {
        fn task_process(&self, _p: &Pool, _t: &mut Task) -> Result<(), ModuleError> {
            Err(ModuleError(842))
        }
    }

    fn pool_with(registry: &ModuleRegistry) -> Pool {
        let mut pool = Pool::new(0, [1, 1, 1]);
        registry.module.storage(&mut pool);
        pool
    }

    #[test]
    fn processes_one_task_then_terminates() {
        let registry = ModuleRegistry::new("double", Box::new(DoubleModule));
        let pool = pool_with(&registry);
        let schemas = pool.task_schema.clone();

        let world = ThreadTransport::build_world(2);
        let mut it = world.into_iter();
        let master = it.next().unwrap();
        let worker = it.next().unwrap();

        let handle = thread::spawn(move || run(&worker, &registry, &pool));

        let mut task = Task::new(0, 0);
        task.storage.insert("value".into(), 21i32.to_le_bytes().to_vec());
        let header = Header {
            tag: Tag::Data,
            tid: 0,
            status: 0,
            loc: [0, 0, 0],
            cid: 0,
        };
        let wire = pack(header, &task, &schemas);
        master.send(1, Tag::Data, &wire).unwrap();

        let (source, tag, payload) = master.recv(Some(1)).unwrap();
        assert_eq!(source, 1);
        assert_eq!(tag, Tag::Result);
        let (_, body) = unpack(&payload, &schemas).unwrap();
        let n = i32::from_le_bytes(body["value"][..4].try_into().unwrap());
        assert_eq!(n, 42);

        master.send(1, Tag::Terminate, &[]).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn task_process_failure_propagates_as_module_error() {
        let registry = ModuleRegistry::new("failing", Box::new(FailingModule));
        let pool = pool_with(&registry);

        let world = ThreadTransport::build_world(2);
        let mut it = world.into_iter();
        let master = it.next().unwrap();
        let worker = it.next().unwrap();

        let handle = thread::spawn(move || run(&worker, &registry, &pool));

        let task = Task::new(0, 0);
        let header = Header {
            tag: Tag::Data,
            tid: 0,
            status: 0,
            loc: [0, 0, 0],
            cid: 0,
        };
        let wire = pack(header, &task, &[]);
        master.send(1, Tag::Data, &wire).unwrap();

        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.exit_code(), 842);
    }
}
