mod claims;
mod common;
mod gc;
mod restart;
mod service;
