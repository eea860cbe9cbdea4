mod local_volume;
mod registry;
mod remote_volume;
mod volume;

pub use local_volume::{LocalVolume, LocalVolumeOptions};
pub use registry::{MountEntry, VolumeRegistry};
pub use remote_volume::RemoteVolume;
pub use volume::Volume;

#[cfg(test)]
mod test_local_volume;
#[cfg(test)]
mod test_registry;
