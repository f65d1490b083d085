mod doctor;
mod manage;

pub use doctor::run_doctor;
pub use manage::{ListOptions, run_add, run_list, run_open, run_remove, run_select, target_units};
