pub mod discovery;
pub mod xlinediscovery;
