mod cache;
mod resolver;

pub use cache::DeviceIdentityCache;
pub use resolver::DeviceIdentityResolver;
