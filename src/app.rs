use std::sync::Arc;

use axum::{
    extract::FromRef,
    routing::{get, post, put},
    Router,
};

use crate::{
    api::v1::{
        admin, auth,
        auth::UserCollection,
        checkout::{self, CheckoutIntentCollection},
        gate,
        reset::{self, LogNotifier, Notifier, PasswordResetCollection},
        shipment::{self, ShipmentCollection},
        token::{JwtState, RefreshTokenCollection},
        user,
    },
    config::Config,
    migrate::MigrationCollection,
    payment::{Gateway, RazorpayGateway},
    status::TransitionPolicy,
};

#[derive(FromRef, Clone)]
pub struct AppState {
    pub argon: argon2::Argon2<'static>,
    pub jwt_state: JwtState,
    pub transition_policy: TransitionPolicy,
    pub gateway: Gateway,
    pub notifier: Notifier,

    pub mongo_client: mongodb::Client,
    pub token_collection: RefreshTokenCollection,
    pub user_collection: UserCollection,
    pub shipment_collection: ShipmentCollection,
    pub checkout_intent_collection: CheckoutIntentCollection,
    pub password_reset_collection: PasswordResetCollection,
    pub migrate_collection: MigrationCollection,
}

impl AppState {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let jwt_state = JwtState::new(&config.jwt)?;
        let gateway = Gateway(Arc::new(RazorpayGateway::new(&config.gateway)?));

        Self::connect(
            &config.mongodb_uri,
            &config.database_name,
            jwt_state,
            gateway,
            config.transition_policy,
        )
        .await
    }

    /// Builds the client without contacting the server.
    pub async fn connect(
        mongodb_uri: &str,
        database_name: &str,
        jwt_state: JwtState,
        gateway: Gateway,
        transition_policy: TransitionPolicy,
    ) -> anyhow::Result<Self> {
        let mongo_client_opt = mongodb::options::ClientOptions::parse(mongodb_uri).await?;
        let mongo_client = mongodb::Client::with_options(mongo_client_opt)?;

        let db = mongo_client.database(database_name);
        Ok(Self {
            argon: argon2::Argon2::default(),
            jwt_state,
            transition_policy,
            gateway,
            notifier: Notifier(Arc::new(LogNotifier)),

            mongo_client,
            token_collection: RefreshTokenCollection(db.collection("refresh_tokens").into()),
            user_collection: UserCollection(db.collection("users").into()),
            shipment_collection: ShipmentCollection(db.collection("shipments").into()),
            checkout_intent_collection: CheckoutIntentCollection(
                db.collection("checkout_intents").into(),
            ),
            password_reset_collection: PasswordResetCollection(
                db.collection("password_resets").into(),
            ),
            migrate_collection: MigrationCollection(db.collection("migrations").into()),
        })
    }
}

pub fn router(app_state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/refresh", post(auth::refresh_access_token))
        .route("/profile", get(user::profile))
        .route("/password-reset", post(reset::request_reset))
        .route("/password-reset/confirm", post(reset::confirm_reset));

    let shipment_routes = Router::new()
        .route("/", get(shipment::index))
        .route("/quote", get(shipment::quote))
        .route("/live", get(shipment::live))
        .route("/checkout", post(checkout::checkout))
        .route("/checkout/:id/confirm", post(checkout::confirm))
        .route("/:id", get(shipment::show))
        .route("/:id/receipt", get(shipment::receipt));

    let admin_routes = Router::new()
        .route("/shipment", get(admin::index))
        .route("/shipment/:id", put(admin::update).delete(admin::delete))
        .route("/shipment/:id/status", put(admin::update_status))
        .route("/checkout/reconcile", post(checkout::reconcile));

    let v1 = Router::new()
        .nest("/auth", auth_routes)
        .nest("/shipment", shipment_routes)
        .nest("/admin", admin_routes)
        .route("/dashboard", get(user::dashboard))
        .route("/track/:id", get(shipment::track))
        .route("/route-gate", get(gate::route_gate));

    Router::new().nest("/api/v1", v1).with_state(app_state)
}
