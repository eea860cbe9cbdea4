mod control;
mod migration;
mod open_files;
mod resolver;
mod rpc;

pub use control::ControlService;
pub use open_files::{OpenFileMgr, OpenFileRecord};
pub use resolver::{Located, PlacementResolver};
pub use rpc::VolumeRpcService;

#[cfg(test)]
mod test_migration;
#[cfg(test)]
mod test_resolver;
