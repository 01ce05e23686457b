//! fmprpc test harness and end-to-end scenarios.
//!
//! The harness wires transports over in-memory pipes and scripts connection
//! handlers so reconnect and retry behavior can be driven deterministically.

pub mod certs;
pub mod harness;

mod proptest_framing;

pub use certs::{generate_test_certs, TestCerts};
pub use harness::{
    init_test_logging, make_connection_for_test, math_protocol, serve, test_opts, transport_pair,
    PipeConnectionTransport, ScriptedHandler, TestConnection,
};
