//! 各个 crate 共享的基本定义，包括配置常量和错误值

#![no_std]

pub mod config;
pub mod error;
