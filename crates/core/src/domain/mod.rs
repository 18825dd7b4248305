pub mod approval;
pub mod planning;
pub mod routing;
pub mod tool;
