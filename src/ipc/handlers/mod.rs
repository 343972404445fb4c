pub mod backup;
pub mod calc;
pub mod classes;
pub mod core;
pub mod extras;
pub mod objectives;
pub mod reports;
pub mod school;
pub mod scores;
pub mod setup;
pub mod students;
pub mod subjects;
