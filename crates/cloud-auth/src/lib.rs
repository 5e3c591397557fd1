//! Cloud login for the subscription client.
//!
//! [`LoginClient`] exchanges account credentials for a bearer token and
//! plugs into the connection manager as a
//! [`TokenProvider`](poolflow_connection::TokenProvider).

pub mod client;

pub use client::{Credentials, Error, LoginClient};
