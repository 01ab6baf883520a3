#![cfg(test)]

mod common;
mod inode;
mod mount;
