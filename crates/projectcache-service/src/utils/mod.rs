pub mod defer;
pub mod size;
