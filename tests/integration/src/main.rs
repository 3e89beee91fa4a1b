// everything here exists for the #[tokio::test] functions; the binary
// itself is an empty shell for the test harness
#![cfg_attr(not(test), allow(dead_code, unused_imports))]


mod client;
mod pubsub;
mod redirect;
mod shared_hash;

fn main() {}
