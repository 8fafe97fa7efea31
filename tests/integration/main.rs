// Integration test suite for Shadow Nexus
//
// Organized into focused modules by feature area.
// Each module tests one surface of the server; common::TestServer boots the
// real listeners on ephemeral ports with a throwaway data directory.

mod common;

mod files;
mod heartbeat;
mod hub;
mod certs;
