pub mod lexer;
pub mod optimizer;
pub mod profile;
pub mod validate;

pub use optimizer::*;
pub use profile::*;
pub use validate::validate;
