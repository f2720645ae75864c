pub mod hal;
pub mod loom;
