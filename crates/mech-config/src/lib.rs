//! Ambient configuration stack (spec §6.1, §6.2): CLI flags via `clap`,
//! config-file parsing hand-rolled to match the dynamic-namespace,
//! fatal-with-line-number semantics spec.md requires.

pub mod cli;
pub mod ini;

pub use cli::Args;
pub use ini::{
    decode_namespaces, encode_namespaces, load_file, parse, ConfigNamespace, KnownNamespaces,
};
