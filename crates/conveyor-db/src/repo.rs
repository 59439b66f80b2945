//! Repository traits and implementations.

pub mod build;
pub mod container;
pub mod pipeline;
pub mod task_cache;
pub mod version;
pub mod worker;

pub use build::BuildRepo;
pub use container::ContainerRepo;
pub use pipeline::PipelineRepo;
pub use task_cache::TaskCacheRepo;
pub use version::VersionRepo;
pub use worker::WorkerRepo;

/// Everything the control plane persists.
pub trait Store:
    PipelineRepo + VersionRepo + BuildRepo + WorkerRepo + ContainerRepo + TaskCacheRepo
{
}

impl<T> Store for T where
    T: PipelineRepo + VersionRepo + BuildRepo + WorkerRepo + ContainerRepo + TaskCacheRepo
{
}
