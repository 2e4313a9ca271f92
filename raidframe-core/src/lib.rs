// vim: tw=80

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// I use a common pattern to substitute mock objects for real ones in test
// builds.  Silence clippy's complaints.
#![allow(clippy::module_inception)]

// Node and buffer tables are indexed by plain integers throughout the DAG
// code.
#![allow(clippy::needless_range_loop)]

pub mod aselect;
pub mod config;
pub mod dag;
pub mod disk;
pub mod layout;
pub mod mem_disk;
pub mod paritylog;
pub mod raid_set;
pub mod recon;
pub mod stripe_map;
pub mod types;
pub mod util;

pub use crate::types::*;
pub use crate::util::*;
