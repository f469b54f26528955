use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    extract::{
        DefaultBodyLimit, FromRequest, FromRequestParts, Path, Request, State,
        rejection::JsonRejection,
    },
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::json;
use tower_http::trace::TraceLayer;

use kundelik_core::auth::{self, AccessToken, DEFAULT_HASH_COST, Identity, TokenIssuer};
use kundelik_core::db::Database;
use kundelik_core::models::{
    Gender, NewPet, NewUser, NutritionRecord, Pet, ProgressRecord, SleepEntry, SleepRecord,
    UpdateMeal, UpdatePet, UpdateProgress, UpdateUser, User, WaterIntake, optional_text,
    require_text, validate_email, validate_password,
};
use kundelik_core::ownership::authorize_self;

const BODY_LIMIT: usize = 1024 * 1024; // 1 MiB

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    tokens: Arc<TokenIssuer>,
    bcrypt_cost: u32,
}

impl AppState {
    /// The guard must not be held across an `.await`.
    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- Request / Response types ---

fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
struct RegisterRequest {
    username: Option<String>,
    email: Option<String>,
    password: Option<String>,
    name: Option<String>,
    phone: Option<String>,
    address: Option<String>,
}

#[derive(Deserialize)]
struct LoginRequest {
    email: Option<String>,
    password: Option<String>,
}

#[derive(Deserialize)]
#[allow(clippy::option_option)]
struct UpdateUserRequest {
    username: Option<String>,
    email: Option<String>,
    password: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    name: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    address: Option<Option<String>>,
}

#[derive(Deserialize)]
struct SelectPetRequest {
    pet_id: i64,
}

#[derive(Deserialize)]
struct CreatePetRequest {
    name: Option<String>,
    species: Option<String>,
    breed: Option<String>,
    age: Option<i64>,
    gender: Option<Gender>,
    medical_history: Option<String>,
}

#[derive(Deserialize)]
#[allow(clippy::option_option)]
struct UpdatePetRequest {
    name: Option<String>,
    species: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    breed: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    age: Option<Option<i64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    gender: Option<Option<Gender>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    medical_history: Option<Option<String>>,
}

#[derive(Deserialize)]
struct AddWaterRequest {
    amount: i64,
}

#[derive(Deserialize)]
struct GoalRequest {
    daily_goal: i64,
}

#[derive(Deserialize)]
#[allow(clippy::option_option)]
struct UpdateMealRequest {
    meal_id: i64,
    name: Option<String>,
    calories: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_some")]
    time: Option<Option<DateTime<Utc>>>,
}

#[derive(Deserialize)]
struct UpdateProgressRequest {
    current_weight: Option<f64>,
    goal_weight: Option<f64>,
    height: Option<f64>,
    weight: Option<f64>,
    #[serde(default)]
    log_entry: bool,
}

/// `{"message": ..., ...body}`
#[derive(Serialize)]
struct Message<T: Serialize> {
    message: &'static str,
    #[serde(flatten)]
    body: T,
}

fn message<T: Serialize>(message: &'static str, body: T) -> Json<Message<T>> {
    Json(Message { message, body })
}

fn plain_message(message: &'static str) -> Json<serde_json::Value> {
    Json(json!({ "message": message }))
}

#[derive(Serialize)]
struct AuthBody {
    #[serde(flatten)]
    token: AccessToken,
    user: User,
}

#[derive(Serialize)]
struct UserBody {
    user: User,
}

#[derive(Serialize)]
struct PetBody {
    pet: Pet,
}

#[derive(Serialize)]
struct CheckAuthResponse {
    authenticated: bool,
    user: User,
}

#[derive(Serialize)]
struct ProfileResponse {
    user: User,
    pets: Vec<Pet>,
    selected_pet: Option<Pet>,
}

#[derive(Serialize)]
struct SleepEndedBody {
    entry: SleepEntry,
    sleep: SleepRecord,
}

#[derive(Serialize)]
struct ProgressUpdatedBody {
    entry_logged: bool,
    #[serde(flatten)]
    progress: ProgressRecord,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

// --- Error handling ---

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Unauthenticated(String),
    Forbidden(String),
    NotFound(String),
    NoActiveSession(String),
    Conflict(String),
    PayloadTooLarge,
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, "unauthenticated", msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::NoActiveSession(msg) => (StatusCode::NOT_FOUND, "no_active_session", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                format!("Request body exceeds {BODY_LIMIT} bytes"),
            ),
            Self::Internal(err) => {
                tracing::error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "Internal server error".to_string(),
                )
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: kind,
                message,
            }),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<kundelik_core::Error> for ApiError {
    fn from(err: kundelik_core::Error) -> Self {
        use kundelik_core::Error;

        match err {
            Error::BadRequest(msg) => Self::BadRequest(msg),
            Error::Unauthenticated | Error::InvalidCredentials => {
                Self::Unauthenticated(err.to_string())
            }
            Error::Forbidden(msg) => Self::Forbidden(msg),
            Error::NotFound(msg) => Self::NotFound(msg),
            Error::Conflict(msg) => Self::Conflict(msg),
            Error::NoActiveSession => Self::NoActiveSession(err.to_string()),
            Error::Database(_) | Error::PasswordHash(_) | Error::Token(_) => {
                Self::Internal(anyhow::Error::new(err))
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge
        } else {
            Self::BadRequest(rejection.body_text())
        }
    }
}

// --- Extractors ---

/// `Json<T>` with rejections rendered through [`ApiError`].
struct JsonBody<T>(T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// Numeric `{id}` path segment.
struct PathId(i64);

impl<S> FromRequestParts<S> for PathId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw): Path<String> = Path::from_request_parts(parts, state)
            .await
            .map_err(|_| ApiError::BadRequest("Missing id".to_string()))?;

        raw.parse::<i64>()
            .map(Self)
            .map_err(|_| ApiError::BadRequest(format!("Invalid id '{raw}'")))
    }
}

// --- Middleware ---

/// Token from an `Authorization: Bearer <token>` header. The scheme is
/// case-insensitive.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim_start().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Resolve the bearer token to an [`Identity`] and attach it to the request.
async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers())
        .ok_or_else(|| ApiError::Unauthenticated("Authentication required".to_string()))?;

    let identity = state.tokens.verify(token)?;

    let exists = {
        let db = state.db();
        db.user_exists(identity.user_id())?
    };
    if !exists {
        tracing::debug!(user_id = identity.user_id(), "token subject no longer exists");
        return Err(ApiError::Unauthenticated(
            "Authentication required".to_string(),
        ));
    }

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Helpers ---

fn required_password(password: Option<String>) -> Result<String, ApiError> {
    let password = password
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("password is required".to_string()))?;
    validate_password(&password)?;
    Ok(password)
}

/// Runs on the blocking pool, outside the db lock.
async fn hash_password(state: &AppState, password: String) -> Result<String, ApiError> {
    let cost = state.bcrypt_cost;
    let hash = tokio::task::spawn_blocking(move || auth::hash_password(&password, cost))
        .await
        .context("password hashing task failed")??;
    Ok(hash)
}

fn issue_token(state: &AppState, user: &User) -> Result<AccessToken, ApiError> {
    Ok(state.tokens.issue(Identity::new(user.id), Utc::now())?)
}

// --- Handlers: public ---

async fn status() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn register(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<RegisterRequest>,
) -> Result<(StatusCode, Json<Message<AuthBody>>), ApiError> {
    let username = require_text("username", req.username.as_deref())?;
    let email = validate_email(&require_text("email", req.email.as_deref())?)?;
    let password = required_password(req.password)?;

    let password_hash = hash_password(&state, password).await?;

    let user = {
        let db = state.db();
        db.create_user(
            &NewUser {
                username,
                email,
                password_hash,
                name: optional_text(req.name),
                phone: optional_text(req.phone),
                address: optional_text(req.address),
            },
            Utc::now(),
        )?
    };

    let token = issue_token(&state, &user)?;
    Ok((
        StatusCode::CREATED,
        message("Registration successful", AuthBody { token, user }),
    ))
}

async fn login(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<LoginRequest>,
) -> Result<Json<Message<AuthBody>>, ApiError> {
    let email = require_text("email", req.email.as_deref())?.to_lowercase();
    let password = req
        .password
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("password is required".to_string()))?;

    let credentials = {
        let db = state.db();
        db.find_credentials(&email)?
    };

    let cost = state.bcrypt_cost;
    let user = tokio::task::spawn_blocking(move || {
        auth::check_credentials(credentials, &password, cost)
    })
    .await
        .context("password verification task failed")??;

    tracing::info!(user_id = user.id, "user logged in");
    let token = issue_token(&state, &user)?;
    Ok(message("Login successful", AuthBody { token, user }))
}

// --- Handlers: account ---

/// Tokens are stateless; the client forgets its copy.
async fn logout(Extension(identity): Extension<Identity>) -> Json<serde_json::Value> {
    tracing::info!(user_id = identity.user_id(), "user logged out");
    plain_message("Logged out successfully")
}

async fn current_user(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<User>, ApiError> {
    let db = state.db();
    Ok(Json(db.user_profile(identity, identity.user_id())?))
}

async fn check_auth(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<CheckAuthResponse>, ApiError> {
    let db = state.db();
    let user = db.user_profile(identity, identity.user_id())?;
    Ok(Json(CheckAuthResponse {
        authenticated: true,
        user,
    }))
}

async fn my_profile(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<ProfileResponse>, ApiError> {
    let db = state.db();
    let user = db.user_profile(identity, identity.user_id())?;
    let pets = db.pets_for_owner(identity, identity.user_id())?;
    let selected_pet = user
        .selected_pet_id
        .and_then(|id| pets.iter().find(|p| p.id == id).cloned());
    Ok(Json(ProfileResponse {
        user,
        pets,
        selected_pet,
    }))
}

async fn select_pet(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    JsonBody(req): JsonBody<SelectPetRequest>,
) -> Result<Json<Message<UserBody>>, ApiError> {
    let db = state.db();
    let user = db.select_pet(identity, req.pet_id)?;
    Ok(message("Pet selected", UserBody { user }))
}

async fn get_user(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    PathId(id): PathId,
) -> Result<Json<User>, ApiError> {
    let db = state.db();
    Ok(Json(db.user_profile(identity, id)?))
}

async fn update_user(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    PathId(id): PathId,
    JsonBody(req): JsonBody<UpdateUserRequest>,
) -> Result<Json<Message<UserBody>>, ApiError> {
    // checked before any password hashing
    authorize_self(identity, id)?;

    let username = req
        .username
        .as_deref()
        .map(|u| require_text("username", Some(u)))
        .transpose()?;
    let email = req.email.as_deref().map(validate_email).transpose()?;
    let password_hash = match req.password {
        Some(password) => Some(hash_password(&state, required_password(Some(password))?).await?),
        None => None,
    };

    let update = UpdateUser {
        username,
        email,
        password_hash,
        name: req.name.map(optional_text),
        phone: req.phone.map(optional_text),
        address: req.address.map(optional_text),
    };

    let user = {
        let db = state.db();
        db.update_user(identity, id, &update)?
    };
    Ok(message("Profile updated", UserBody { user }))
}

async fn delete_user(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    PathId(id): PathId,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db();
    db.delete_user(identity, id)?;
    Ok(plain_message("Account deleted"))
}

async fn list_user_pets(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    PathId(id): PathId,
) -> Result<Json<Vec<Pet>>, ApiError> {
    let db = state.db();
    Ok(Json(db.pets_for_owner(identity, id)?))
}

// --- Handlers: pets ---

async fn list_pets(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<Pet>>, ApiError> {
    let db = state.db();
    Ok(Json(db.pets_for_owner(identity, identity.user_id())?))
}

async fn create_pet(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    JsonBody(req): JsonBody<CreatePetRequest>,
) -> Result<(StatusCode, Json<Message<PetBody>>), ApiError> {
    let pet = NewPet {
        name: require_text("name", req.name.as_deref())?,
        species: require_text("species", req.species.as_deref())?,
        breed: optional_text(req.breed),
        age: req.age,
        gender: req.gender,
        medical_history: optional_text(req.medical_history),
    };

    let db = state.db();
    let pet = db.insert_pet(identity, &pet, Utc::now())?;
    tracing::info!(user_id = identity.user_id(), pet_id = pet.id, "pet added");
    Ok((StatusCode::CREATED, message("Pet added", PetBody { pet })))
}

async fn get_pet(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    PathId(id): PathId,
) -> Result<Json<Pet>, ApiError> {
    let db = state.db();
    Ok(Json(db.owned_pet(identity, id)?))
}

async fn update_pet(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    PathId(id): PathId,
    JsonBody(req): JsonBody<UpdatePetRequest>,
) -> Result<Json<Message<PetBody>>, ApiError> {
    let update = UpdatePet {
        name: req.name,
        species: req.species,
        breed: req.breed.map(optional_text),
        age: req.age,
        gender: req.gender,
        medical_history: req.medical_history.map(optional_text),
    };

    let db = state.db();
    let pet = db.update_pet(identity, id, &update)?;
    Ok(message("Pet updated", PetBody { pet }))
}

async fn delete_pet(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    PathId(id): PathId,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db();
    db.delete_pet(identity, id)?;
    Ok(plain_message("Pet deleted"))
}

// --- Handlers: water ---

async fn get_water(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<WaterIntake>, ApiError> {
    let db = state.db();
    Ok(Json(db.water(identity)?))
}

async fn add_water(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    JsonBody(req): JsonBody<AddWaterRequest>,
) -> Result<(StatusCode, Json<Message<WaterIntake>>), ApiError> {
    let db = state.db();
    let water = db.add_water(identity, req.amount, Utc::now())?;
    Ok((StatusCode::CREATED, message("Water intake added", water)))
}

async fn set_water_goal(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    JsonBody(req): JsonBody<GoalRequest>,
) -> Result<Json<Message<WaterIntake>>, ApiError> {
    let db = state.db();
    let water = db.set_water_goal(identity, req.daily_goal)?;
    Ok(message("Water goal updated", water))
}

async fn reset_water(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Message<WaterIntake>>, ApiError> {
    let db = state.db();
    let water = db.reset_water(identity, Utc::now())?;
    Ok(message("Water intake reset", water))
}

// --- Handlers: sleep ---

async fn get_sleep(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<SleepRecord>, ApiError> {
    let db = state.db();
    Ok(Json(db.sleep(identity)?))
}

async fn start_sleep(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Message<SleepRecord>>, ApiError> {
    let db = state.db();
    let sleep = db.start_sleep(identity, Utc::now())?;
    Ok(message("Sleep tracking started", sleep))
}

async fn end_sleep(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Message<SleepEndedBody>>, ApiError> {
    let db = state.db();
    let entry = db.end_sleep(identity, Utc::now())?;
    let sleep = db.sleep(identity)?;
    Ok(message("Sleep tracking ended", SleepEndedBody { entry, sleep }))
}

async fn reset_sleep(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Message<SleepRecord>>, ApiError> {
    let db = state.db();
    let sleep = db.reset_sleep(identity)?;
    Ok(message("Sleep history reset", sleep))
}

// --- Handlers: nutrition ---

async fn get_nutrition(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<NutritionRecord>, ApiError> {
    let db = state.db();
    Ok(Json(db.nutrition(identity)?))
}

async fn update_nutrition(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    JsonBody(req): JsonBody<UpdateMealRequest>,
) -> Result<Json<Message<NutritionRecord>>, ApiError> {
    let update = UpdateMeal {
        name: req.name,
        calories: req.calories,
        time: req.time,
    };

    let db = state.db();
    let nutrition = db.update_meal(identity, req.meal_id, &update)?;
    Ok(message("Meal updated", nutrition))
}

async fn set_calorie_goal(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    JsonBody(req): JsonBody<GoalRequest>,
) -> Result<Json<Message<NutritionRecord>>, ApiError> {
    let db = state.db();
    let nutrition = db.set_calorie_goal(identity, req.daily_goal)?;
    Ok(message("Calorie goal updated", nutrition))
}

async fn reset_nutrition(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Message<NutritionRecord>>, ApiError> {
    let db = state.db();
    let nutrition = db.reset_nutrition(identity)?;
    Ok(message("Nutrition reset", nutrition))
}

// --- Handlers: progress ---

async fn get_progress(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<ProgressRecord>, ApiError> {
    let db = state.db();
    Ok(Json(db.progress(identity)?))
}

async fn update_progress(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    JsonBody(req): JsonBody<UpdateProgressRequest>,
) -> Result<Json<Message<ProgressUpdatedBody>>, ApiError> {
    let update = UpdateProgress {
        current_weight: req.current_weight,
        goal_weight: req.goal_weight,
        height: req.height,
        weight: req.weight,
        log_entry: req.log_entry,
    };

    let db = state.db();
    let (progress, entry_logged) = db.update_progress(identity, &update, Utc::now())?;
    Ok(message(
        "Progress updated",
        ProgressUpdatedBody {
            entry_logged,
            progress,
        },
    ))
}

async fn reset_progress(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Message<ProgressRecord>>, ApiError> {
    let db = state.db();
    let progress = db.reset_progress(identity)?;
    Ok(message("Progress reset", progress))
}

async fn route_not_found() -> ApiError {
    ApiError::NotFound("Route not found".to_string())
}

// --- Router builder ---

fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/logout", post(logout))
        .route("/api/current-user", get(current_user))
        .route("/api/check-auth", get(check_auth))
        .route("/api/my-profile", get(my_profile))
        .route("/api/select-pet", post(select_pet))
        .route(
            "/api/users/{id}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/api/users/{id}/pets", get(list_user_pets))
        .route("/api/pets", get(list_pets).post(create_pet))
        .route(
            "/api/pets/{id}",
            get(get_pet).put(update_pet).delete(delete_pet),
        )
        .route("/api/water", get(get_water))
        .route("/api/water/add", post(add_water))
        .route("/api/water/goal", post(set_water_goal))
        .route("/api/water/reset", post(reset_water))
        .route("/api/sleep", get(get_sleep))
        .route("/api/sleep/start", post(start_sleep))
        .route("/api/sleep/end", post(end_sleep))
        .route("/api/sleep/reset", post(reset_sleep))
        .route("/api/nutrition", get(get_nutrition))
        .route("/api/nutrition/update", post(update_nutrition))
        .route("/api/nutrition/goal", post(set_calorie_goal))
        .route("/api/nutrition/reset", post(reset_nutrition))
        .route("/api/progress", get(get_progress))
        .route("/api/progress/update", post(update_progress))
        .route("/api/progress/reset", post(reset_progress))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/api/status", get(status))
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .merge(protected)
        .fallback(route_not_found)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    db: Database,
    tokens: TokenIssuer,
    port: u16,
    bind: &str,
) -> anyhow::Result<()> {
    let state = AppState {
        db: Arc::new(Mutex::new(db)),
        tokens: Arc::new(tokens),
        bcrypt_cost: DEFAULT_HASH_COST,
    };

    let app = build_router(state);

    if bind != "127.0.0.1" && bind != "localhost" {
        tracing::warn!("listening on {bind}; the API is reachable from other hosts");
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;
    tracing::info!("listening on http://{bind}:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
