//! Provides the bundled peer transport adapters.
//!
//! Both adapters satisfy the [CachePeer](crate::peers::CachePeer) contract:
//!
//! * [resp](resp) speaks the node's native TCP protocol (see [crate::server] and
//!   [crate::protocol]). This is the default transport for peer traffic.
//! * [http](http) provides an HTTP client and a matching server endpoint for
//!   environments where plain HTTP is easier to route or inspect.
//!
//! Hosts with exotic requirements can bring their own adapter - anything
//! implementing [CachePeer](crate::peers::CachePeer) can be handed to a
//! [ConsistentPicker](crate::peers::ConsistentPicker).
pub mod http;
pub mod resp;
