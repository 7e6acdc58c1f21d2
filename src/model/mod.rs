pub mod common;
pub mod entity;
pub mod flags;
pub mod graph;
pub mod instruction;
pub mod inventory;
pub mod record;
pub mod schema;
pub mod summary;

pub use common::*;
pub use entity::*;
pub use flags::*;
pub use graph::*;
pub use instruction::*;
pub use inventory::*;
pub use record::*;
pub use schema::*;
pub use summary::*;
