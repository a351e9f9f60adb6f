pub mod container_id;
pub mod id_factory;

pub use container_id::{ContainerId, Counter};
pub use id_factory::IdFactory;
