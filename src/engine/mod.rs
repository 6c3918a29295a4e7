pub mod ideal;
pub mod modes;
pub mod reconcile;
pub mod task;
