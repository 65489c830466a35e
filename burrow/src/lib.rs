//! burrow lets an application on one private network reach a service on
//! another private network across NAT: two endpoint processes punch a UDP
//! hole with the help of a tiny rendezvous broker, then multiplex any
//! number of TCP byte-streams over that single hole using the reliable
//! transport implemented in `burrow-proto`.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `args` | Command line parsing for the three run modes |
//! | `endpoint` | Reader/writer tasks wrapping a local byte-stream |
//! | `rendezvous` | The UDP address broker matching two room registrants |
//! | `session` | One UDP tunnel: addresses, authentication, queues |
//! | `spool` | Disk-backed overflow queues |
//! | `stream` | Per-stream context tying reliability to an endpoint |
//! | `worker` | The two endpoint event loops (origin and terminus) |

pub mod args;
pub mod endpoint;
pub mod rendezvous;
pub mod session;
pub mod spool;
pub mod stream;
pub mod worker;
