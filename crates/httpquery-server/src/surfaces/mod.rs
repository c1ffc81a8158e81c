//! The two call surfaces and the route table that exposes them.

pub mod controller;
pub mod minimal;

use crate::routing::QueryRoutes;
use crate::service::QueryService;
use crate::types::ServerResult;
use controller::PeopleController;
use std::sync::Arc;

pub const CONTROLLER_ROUTE: &str = "controller";
pub const CONTROLLER_COUNT_ROUTE: &str = "controller-count";
pub const PEOPLE_ROUTE: &str = "people";

/// Register every query route.
pub fn build_routes(service: Arc<QueryService>) -> ServerResult<QueryRoutes> {
    let mut routes = QueryRoutes::new();
    let controller = Arc::new(PeopleController::new(Arc::clone(&service)));

    routes
        .map_action("/api/people", Arc::clone(&controller), PeopleController::index)?
        .with_name(CONTROLLER_ROUTE);
    routes
        .map_action("/api/people/{count}", controller, PeopleController::sized)?
        .with_name(CONTROLLER_COUNT_ROUTE);
    routes
        .map_query("/people", minimal::people(service))?
        .with_name(PEOPLE_ROUTE);

    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::routing::QUERY_METHOD;

    #[test]
    fn test_route_table() {
        let service = Arc::new(QueryService::new(&ServerConfig::default()));
        let routes = build_routes(service).unwrap();

        assert_eq!(routes.registrations().len(), 3);
        assert_eq!(routes.path_for(PEOPLE_ROUTE, &[]).unwrap(), "/people");
        assert_eq!(
            routes.path_for(CONTROLLER_COUNT_ROUTE, &[("count", "5")]).unwrap(),
            "/api/people/5"
        );
        assert!(routes.find(QUERY_METHOD, "/api/people").is_some());
        assert!(routes.find(QUERY_METHOD, "/api/people/12").is_some());
    }
}
