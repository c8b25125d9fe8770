pub mod env;
#[cfg(test)]
pub mod test;
