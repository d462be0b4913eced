#[macro_use]
mod boilerplate;

/// Provide interoperability with C return values.
pub(crate) mod interop;
