//! `start-proxy` / `stop-proxy`.

use dockertree_core::proxy::ProxyCoordinator;

use super::{with_project, CmdResult};

/// Start the global proxy and push the initial route configuration.
pub fn start(json: bool) -> CmdResult {
    with_project("proxy.start", json, |project| {
        let mut coordinator = ProxyCoordinator::new(&project.runtime, &project.config)?;
        let routes = coordinator.start()?;
        if !json {
            println!("Proxy running on ports 80/443 ({routes} routes configured)");
        }
        Ok(serde_json::json!({ "routes": routes }))
    })
}

/// Stop the global proxy.
pub fn stop(json: bool) -> CmdResult {
    with_project("proxy.stop", json, |project| {
        let coordinator = ProxyCoordinator::new(&project.runtime, &project.config)?;
        coordinator.stop()?;
        if !json {
            println!("Proxy stopped");
        }
        Ok(serde_json::json!({}))
    })
}
