//! Messages every peer understands

use serde::{Deserialize, Serialize};
use tether_core::Result;

use crate::descriptor::Permission;
use crate::registry::MessageRegistry;
use crate::request::Request;

/// Empty payload, `{}` on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Empty {}

/// Liveness probe answered with `{}`
///
/// Valid on `control-controller`, `host-controller` and `controller-host`.
///
/// # Errors
///
/// See [`crate::RequestBuilder::build`].
pub fn ping() -> Result<Request<Empty, Empty>> {
    Request::builder("ping")
        .links(["control-controller", "host-controller", "controller-host"])
        .permission(Permission::Unrestricted)
        .default_handler(|_ctx, _req: Empty| async { Ok(Empty {}) })
        .build()
}

/// Registry holding the built-in messages
///
/// # Errors
///
/// Fails if a built-in descriptor does not build.
pub fn builtin_registry() -> Result<MessageRegistry> {
    let mut registry = MessageRegistry::new();
    registry.register(ping()?)?;
    Ok(registry)
}
