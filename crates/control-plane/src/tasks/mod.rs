pub mod bandwidth;
pub mod health;
pub mod retention;
