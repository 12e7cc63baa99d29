pub mod change;
pub mod common;
pub mod validator;
