mod core;
mod files;

pub(crate) use core::{health, root_redirect, shutdown, status};
pub(crate) use files::{file, ls};
