pub mod locks;

pub mod types {
    pub use cairn_utils::types::{BoundedString, LabelName, Name};
}
