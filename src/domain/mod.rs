// Domain layer: record model and the stage port. Depends only on utils.

pub mod model;
pub mod ports;
