pub mod reference;
pub mod validation;
