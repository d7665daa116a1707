//! Which page of the web front end a requester may open.

use serde::Serialize;

use crate::api::v1::auth::{Session, UserRole};

pub const LANDING: &str = "/";
pub const LOGIN: &str = "/login";
pub const DASHBOARD: &str = "/dashboard";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Landing,
    Login,
    Register,
    Dashboard,
    CreateShipment,
    MyShipments,
    Admin,
    ShipmentSuccess(String),
    ShipmentDetail(String),
    Unknown,
}

impl Route {
    pub fn parse(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|it| !it.is_empty()).collect();

        match segments.as_slice() {
            [] => Self::Landing,
            ["login"] => Self::Login,
            ["register"] => Self::Register,
            ["dashboard"] => Self::Dashboard,
            ["create-shipment"] => Self::CreateShipment,
            ["my-shipments"] => Self::MyShipments,
            ["admin"] => Self::Admin,
            ["shipment-success", id] => Self::ShipmentSuccess(id.to_string()),
            ["shipment", id] => Self::ShipmentDetail(id.to_string()),
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    Anonymous,
    User,
    Admin,
}

impl Requester {
    pub fn of(session: Option<&Session>) -> Self {
        match session.map(|it| it.role) {
            None => Self::Anonymous,
            Some(UserRole::User) => Self::User,
            Some(UserRole::Admin) => Self::Admin,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "decision", content = "location", rename_all = "lowercase")]
pub enum Gate {
    Allow,
    Redirect(&'static str),
}

/// Detail and success pages are open to all; the data behind them is checked
/// by the API itself.
pub fn gate(route: &Route, requester: Requester) -> Gate {
    use Requester::*;

    match (route, requester) {
        (Route::Landing, _) => Gate::Allow,
        (Route::Login | Route::Register, Anonymous) => Gate::Allow,
        (Route::Login | Route::Register, User | Admin) => Gate::Redirect(DASHBOARD),
        (Route::Dashboard | Route::CreateShipment | Route::MyShipments, Anonymous) => {
            Gate::Redirect(LOGIN)
        }
        (Route::Dashboard | Route::CreateShipment | Route::MyShipments, User | Admin) => {
            Gate::Allow
        }
        (Route::Admin, Admin) => Gate::Allow,
        (Route::Admin, Anonymous | User) => Gate::Redirect(LOGIN),
        (Route::ShipmentSuccess(_) | Route::ShipmentDetail(_), _) => Gate::Allow,
        (Route::Unknown, _) => Gate::Redirect(LANDING),
    }
}

#[cfg(test)]
mod tests {
    use bson::oid::ObjectId;

    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(Route::parse("/"), Route::Landing);
        assert_eq!(Route::parse(""), Route::Landing);
        assert_eq!(Route::parse("/login/"), Route::Login);
        assert_eq!(Route::parse("/admin?tab=all"), Route::Admin);
        assert_eq!(
            Route::parse("/shipment-success/65f1c0ffee"),
            Route::ShipmentSuccess("65f1c0ffee".to_string())
        );
        assert_eq!(
            Route::parse("/shipment/abc"),
            Route::ShipmentDetail("abc".to_string())
        );
        assert_eq!(Route::parse("/shipment"), Route::Unknown);
        assert_eq!(Route::parse("/admin/users"), Route::Unknown);
        assert_eq!(Route::parse("/nowhere"), Route::Unknown);
    }

    #[test]
    fn test_requester() {
        let session = |role| Session {
            id: ObjectId::new(),
            role,
        };

        assert_eq!(Requester::of(None), Requester::Anonymous);
        assert_eq!(Requester::of(Some(&session(UserRole::User))), Requester::User);
        assert_eq!(Requester::of(Some(&session(UserRole::Admin))), Requester::Admin);
    }

    #[test]
    fn test_gate_table() {
        use Requester::*;

        let table = [
            ("/", [Gate::Allow, Gate::Allow, Gate::Allow]),
            ("/login", [Gate::Allow, Gate::Redirect("/dashboard"), Gate::Redirect("/dashboard")]),
            ("/register", [Gate::Allow, Gate::Redirect("/dashboard"), Gate::Redirect("/dashboard")]),
            ("/dashboard", [Gate::Redirect("/login"), Gate::Allow, Gate::Allow]),
            ("/create-shipment", [Gate::Redirect("/login"), Gate::Allow, Gate::Allow]),
            ("/my-shipments", [Gate::Redirect("/login"), Gate::Allow, Gate::Allow]),
            ("/admin", [Gate::Redirect("/login"), Gate::Redirect("/login"), Gate::Allow]),
            ("/shipment-success/x", [Gate::Allow, Gate::Allow, Gate::Allow]),
            ("/shipment/x", [Gate::Allow, Gate::Allow, Gate::Allow]),
            ("/elsewhere", [Gate::Redirect("/"), Gate::Redirect("/"), Gate::Redirect("/")]),
        ];

        for (path, expected) in table {
            let route = Route::parse(path);
            for (requester, expected) in [Anonymous, User, Admin].into_iter().zip(expected) {
                assert_eq!(gate(&route, requester), expected, "{path} as {requester:?}");
            }
        }
    }

    #[test]
    fn test_gate_serializes_for_clients() {
        assert_eq!(
            serde_json::to_value(Gate::Redirect("/login")).unwrap(),
            serde_json::json!({ "decision": "redirect", "location": "/login" })
        );
        assert_eq!(
            serde_json::to_value(Gate::Allow).unwrap(),
            serde_json::json!({ "decision": "allow" })
        );
    }
}
