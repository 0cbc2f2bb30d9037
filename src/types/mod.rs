//! Type definitions

pub mod decision;
pub mod import;
pub mod job;
pub mod mapping;
pub mod row;

pub use decision::*;
pub use import::*;
pub use job::*;
pub use mapping::*;
pub use row::*;
