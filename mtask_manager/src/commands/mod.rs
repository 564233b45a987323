pub mod global;
pub mod inspect;
