//! kiwi-identd daemon - ident and control listeners
//!
//! This crate wires the registry and the line protocols to sockets:
//! - `config` - daemon configuration (file, environment, defaults)
//! - `listen` - `scheme://address` listener specifications
//! - `server` - the two accept loops and their per-connection sessions
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       kiwi-identd                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────────┐                  ┌──────────────────┐   │
//! │  │  IdentdServer   │                  │  ControlServer   │   │
//! │  │  (TCP, :113)    │                  │ (TCP/Unix, :1133)│   │
//! │  └────────┬────────┘                  └────────┬─────────┘   │
//! │           │ one task per peer                  │ one task    │
//! │           ▼                                    ▼ per client  │
//! │  ┌─────────────────┐                  ┌──────────────────┐   │
//! │  │  IdentSession   │                  │  ControlSession  │   │
//! │  │  (one query)    │                  │  (until EOF)     │   │
//! │  └────────┬────────┘                  └────────┬─────────┘   │
//! │           │ lookup                add/del/clear│/lookup      │
//! │           └──────────────┐      ┌──────────────┘             │
//! │                          ▼      ▼                            │
//! │                   ┌──────────────────┐                       │
//! │                   │     Registry     │                       │
//! │                   └──────────────────┘                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Session failures end that session only

pub mod config;
pub mod listen;
pub mod server;
