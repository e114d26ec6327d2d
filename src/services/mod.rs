//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod deploy;
pub mod packager;
pub mod proxy;
pub mod resolver;
pub mod supervisor;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;
