mod harness;

mod auth_test;
mod channel_test;
mod handshake_test;
mod rekey_test;
