use thiserror::Error;

use crate::NodeId;

/// Reasons why [`ProxyEngine::create_proxy()`][crate::ProxyEngine::create_proxy] did not
/// create a proxy.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum CreateProxyError {
    /// The node already has a proxy. Each node may be mirrored by at most one proxy at a time.
    #[error("node {0} already has a proxy")]
    AlreadyExists(NodeId),

    /// The proxy storage could not provide another slot, either because memory could not be
    /// obtained or because the configured capacity limit has been reached.
    ///
    /// Nothing was created. The caller may retry after other proxies have been removed.
    #[error("no proxy slot available")]
    NoSlotAvailable,
}

/// Reasons why a [`Compiler`][crate::Compiler] could not produce a runtime object.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum CompileError {
    /// A resource referenced by the content could not be found.
    #[error("missing resource '{0}'")]
    MissingResource(String),

    /// The runtime object could not be built for any other reason.
    #[error("compilation failed: {0}")]
    Failed(String),
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(CreateProxyError: Send, Sync, Debug);
    assert_impl_all!(CompileError: Send, Sync, Debug);

    #[test]
    fn messages_name_the_culprit() {
        assert_eq!(
            CreateProxyError::AlreadyExists(NodeId::new(7)).to_string(),
            "node #7 already has a proxy"
        );
        assert_eq!(
            CompileError::MissingResource("rock.mesh".to_string()).to_string(),
            "missing resource 'rock.mesh'"
        );
    }
}
