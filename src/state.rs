use sqlx::PgPool;

use crate::store::FlagStore;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub flags: FlagStore,
}
