//! Axum + Askama UI for browsing grants, sync logs and the diagnosis API.

use std::collections::BTreeMap;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::net::TcpListener;
use tracing::warn;

pub const CRATE_NAME: &str = "gnavi-web";

const DIAGNOSE_MODEL: &str = "gpt-4o-mini";

#[derive(Clone)]
pub struct AppState {
    pub pool: Option<PgPool>,
    pub diagnose: Option<DiagnoseClient>,
}

impl AppState {
    pub fn new(pool: Option<PgPool>, diagnose: Option<DiagnoseClient>) -> Self {
        Self { pool, diagnose }
    }
}

/// Chat-completion client for the diagnosis endpoint. One request per
/// diagnosis, no retry, no streaming.
#[derive(Clone)]
pub struct DiagnoseClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl DiagnoseClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok()?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Some(Self::new(base_url, api_key))
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let body = serde_json::json!({
            "model": DIAGNOSE_MODEL,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.7,
        });
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("chat completion returned HTTP {status}");
        }
        let value: serde_json::Value = resp.json().await?;
        value
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("chat completion response had no content"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebGrant {
    pub id: i64,
    pub grant_type: String,
    pub title: String,
    pub organization: String,
    pub level: String,
    pub area_prefecture: String,
    pub area_city: String,
    pub industry: String,
    pub target_type: String,
    pub max_amount: String,
    pub subsidy_rate: String,
    pub url: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebSyncLog {
    pub source: String,
    pub records_synced: i32,
    pub status: String,
    pub message: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize, Default)]
struct GrantsQuery {
    area: Option<String>,
    industry: Option<String>,
    q: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total_grants: i64,
    grants_today: i64,
    latest_logs: Vec<WebSyncLog>,
}

#[derive(Template)]
#[template(path = "grants.html")]
struct GrantsPageTemplate {
    selected_area: String,
    selected_industry: String,
    keyword: String,
    areas: Vec<FacetCountRow>,
}

#[derive(Debug, Clone)]
struct FacetCountRow {
    name: String,
    count: usize,
    selected: bool,
}

#[derive(Template)]
#[template(path = "grants_table_partial.html")]
struct GrantsTablePartialTemplate {
    grants: Vec<WebGrant>,
    page: usize,
    total_pages: usize,
}

#[derive(Template)]
#[template(path = "logs.html")]
struct LogsTemplate {
    logs: Vec<WebSyncLog>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/grants", get(grants_page_handler))
        .route("/grants/table", get(grants_table_handler))
        .route("/logs", get(logs_handler))
        .route("/api/search", post(search_handler))
        .route("/api/diagnose", post(diagnose_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("GNAVI_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let pool = connect_db_from_env().await;
    if pool.is_none() {
        warn!("DATABASE_URL not set or unreachable, pages will render empty");
    }
    let state = AppState::new(pool, DiagnoseClient::from_env());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn connect_db_from_env() -> Option<PgPool> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    PgPool::connect(&database_url).await.ok()
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let (total_grants, grants_today) = match &state.pool {
        Some(pool) => match load_counts(pool).await {
            Ok(counts) => counts,
            Err(err) => return server_error(err),
        },
        None => (0, 0),
    };
    let latest_logs = match &state.pool {
        Some(pool) => match load_sync_logs(pool, 5).await {
            Ok(logs) => logs,
            Err(err) => return server_error(err),
        },
        None => vec![],
    };
    render_html(IndexTemplate {
        total_grants,
        grants_today,
        latest_logs,
    })
}

async fn grants_page_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GrantsQuery>,
) -> Response {
    let grants = match load_filtered_grants(&state, &query).await {
        Ok(grants) => grants,
        Err(err) => return server_error(err),
    };
    let selected_area = query.area.clone().unwrap_or_default();
    render_html(GrantsPageTemplate {
        areas: area_facets(&grants, &selected_area),
        selected_area,
        selected_industry: query.industry.clone().unwrap_or_default(),
        keyword: query.q.clone().unwrap_or_default(),
    })
}

async fn grants_table_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GrantsQuery>,
) -> Response {
    let grants = match load_filtered_grants(&state, &query).await {
        Ok(grants) => grants,
        Err(err) => return server_error(err),
    };
    let per_page = query.per_page.unwrap_or(20).max(1);
    let total_pages = grants.len().max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let page_rows = grants.into_iter().skip(start).take(per_page).collect();
    let mut resp = render_html(GrantsTablePartialTemplate {
        grants: page_rows,
        page,
        total_pages,
    });
    resp.headers_mut().insert(
        header::HeaderName::from_static("hx-trigger"),
        header::HeaderValue::from_static("grantsTableLoaded"),
    );
    resp
}

async fn logs_handler(State(state): State<Arc<AppState>>) -> Response {
    let logs = match &state.pool {
        Some(pool) => match load_sync_logs(pool, 50).await {
            Ok(logs) => logs,
            Err(err) => return server_error(err),
        },
        None => vec![],
    };
    render_html(LogsTemplate { logs })
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    area: Option<String>,
    industry: Option<String>,
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> Response {
    let (area, industry) = match (req.area, req.industry) {
        (Some(area), Some(industry)) if !area.is_empty() && !industry.is_empty() => {
            (area, industry)
        }
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "area and industry are required"})),
            )
                .into_response();
        }
    };
    let grants = match &state.pool {
        Some(pool) => match search_grants(pool, &area, &industry).await {
            Ok(grants) => grants,
            Err(err) => return api_error(err),
        },
        None => vec![],
    };
    let count = grants.len();
    Json(serde_json::json!({"grants": grants, "count": count})).into_response()
}

#[derive(Debug, Deserialize)]
struct DiagnoseRequest {
    #[serde(default)]
    area: String,
    #[serde(default)]
    industry: String,
    #[serde(default)]
    employees: String,
    #[serde(default)]
    description: String,
}

async fn diagnose_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DiagnoseRequest>,
) -> Response {
    let Some(client) = &state.diagnose else {
        return api_error(anyhow::anyhow!("diagnosis is not configured"));
    };
    let candidates = match &state.pool {
        Some(pool) => match search_grants(pool, &req.area, &req.industry).await {
            Ok(grants) => grants,
            Err(err) => return api_error(err),
        },
        None => vec![],
    };
    let prompt = build_diagnose_prompt(&req, &candidates);
    match client.complete(&prompt).await {
        Ok(result) => Json(serde_json::json!({"result": result})).into_response(),
        Err(err) => api_error(err),
    }
}

fn build_diagnose_prompt(req: &DiagnoseRequest, candidates: &[WebGrant]) -> String {
    let mut listing = String::new();
    for grant in candidates.iter().take(20) {
        listing.push_str(&format!(
            "- {}（{}、上限 {}、補助率 {}）\n",
            grant.title, grant.organization, grant.max_amount, grant.subsidy_rate
        ));
    }
    if listing.is_empty() {
        listing.push_str("（候補なし）\n");
    }
    format!(
        "あなたは補助金・助成金の専門家です。以下の事業者情報をもとに、\
         活用できる可能性のある補助金・助成金を診断してください。\n\n\
         事業者情報:\n\
         - 所在地: {}\n\
         - 業種: {}\n\
         - 従業員数: {}\n\
         - 事業内容: {}\n\n\
         候補一覧:\n{}\n\
         上記の候補から適合度の高い順に最大3件を選び、それぞれ選んだ理由を\
         簡潔な日本語で説明してください。",
        req.area, req.industry, req.employees, req.description, listing
    )
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn api_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": err.to_string()})),
    )
        .into_response()
}

async fn load_counts(pool: &PgPool) -> anyhow::Result<(i64, i64)> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS total, \
         COUNT(*) FILTER (WHERE created_at >= date_trunc('day', NOW())) AS today \
         FROM grants",
    )
    .fetch_one(pool)
    .await?;
    Ok((row.try_get("total")?, row.try_get("today")?))
}

async fn load_filtered_grants(
    state: &AppState,
    query: &GrantsQuery,
) -> anyhow::Result<Vec<WebGrant>> {
    let Some(pool) = &state.pool else {
        return Ok(vec![]);
    };
    let area = query.area.clone().unwrap_or_default();
    let industry = query.industry.clone().unwrap_or_default();
    let keyword = query.q.clone().unwrap_or_default();
    let rows = sqlx::query(
        "SELECT id, type, title, organization, level, area_prefecture, area_city, \
                industry, target_type, max_amount, subsidy_rate, url, created_at \
           FROM grants \
          WHERE ($1 = '' OR area_prefecture = $1 OR level = 'national') \
            AND ($2 = '' OR industry LIKE '%' || $2 || '%') \
            AND ($3 = '' OR title LIKE '%' || $3 || '%' OR description LIKE '%' || $3 || '%') \
          ORDER BY created_at DESC, id DESC \
          LIMIT 500",
    )
    .bind(&area)
    .bind(&industry)
    .bind(&keyword)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(web_grant_from_row).collect()
}

async fn search_grants(
    pool: &PgPool,
    area: &str,
    industry: &str,
) -> anyhow::Result<Vec<WebGrant>> {
    let rows = sqlx::query(
        "SELECT id, type, title, organization, level, area_prefecture, area_city, \
                industry, target_type, max_amount, subsidy_rate, url, created_at \
           FROM grants \
          WHERE (level = 'national' OR area_prefecture = $1) \
            AND ($2 = '' OR industry = '' OR industry LIKE '%' || $2 || '%') \
          ORDER BY created_at DESC, id DESC \
          LIMIT 100",
    )
    .bind(area)
    .bind(industry)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(web_grant_from_row).collect()
}

fn web_grant_from_row(row: sqlx::postgres::PgRow) -> anyhow::Result<WebGrant> {
    let created_at: chrono::DateTime<chrono::Utc> = row.try_get("created_at")?;
    Ok(WebGrant {
        id: row.try_get("id")?,
        grant_type: row.try_get("type")?,
        title: row.try_get("title")?,
        organization: row.try_get("organization")?,
        level: row.try_get("level")?,
        area_prefecture: row.try_get("area_prefecture")?,
        area_city: row.try_get("area_city")?,
        industry: row.try_get("industry")?,
        target_type: row.try_get("target_type")?,
        max_amount: row.try_get("max_amount")?,
        subsidy_rate: row.try_get("subsidy_rate")?,
        url: row.try_get("url")?,
        created_at: created_at.format("%Y-%m-%d").to_string(),
    })
}

async fn load_sync_logs(pool: &PgPool, limit: i64) -> anyhow::Result<Vec<WebSyncLog>> {
    let rows = sqlx::query(
        "SELECT source, records_synced, status, message, created_at \
           FROM sync_logs ORDER BY created_at DESC, id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let created_at: chrono::DateTime<chrono::Utc> = row.try_get("created_at")?;
        out.push(WebSyncLog {
            source: row.try_get("source")?,
            records_synced: row.try_get("records_synced")?,
            status: row.try_get("status")?,
            message: row.try_get("message")?,
            created_at: created_at.format("%Y-%m-%d %H:%M").to_string(),
        });
    }
    Ok(out)
}

fn area_facets(grants: &[WebGrant], selected_area: &str) -> Vec<FacetCountRow> {
    let mut counts = BTreeMap::<String, usize>::new();
    for grant in grants {
        if !grant.area_prefecture.is_empty() {
            *counts.entry(grant.area_prefecture.clone()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .map(|(name, count)| FacetCountRow {
            selected: !selected_area.is_empty() && selected_area == name,
            name,
            count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn no_db_app() -> Router {
        app(AppState::new(None, None))
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn pages_render_empty_without_database() {
        for uri in ["/", "/grants", "/grants/table", "/logs"] {
            let resp = no_db_app()
                .oneshot(
                    axum::http::Request::builder()
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "uri {uri}");
        }
    }

    #[tokio::test]
    async fn index_shows_zero_counts_without_database() {
        let resp = no_db_app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let text = body_text(resp).await;
        assert!(text.contains("Grant Navi"));
    }

    #[tokio::test]
    async fn search_requires_area_and_industry() {
        for payload in [
            serde_json::json!({}),
            serde_json::json!({"area": "山形県"}),
            serde_json::json!({"industry": "旅館業"}),
            serde_json::json!({"area": "", "industry": "旅館業"}),
        ] {
            let resp = no_db_app()
                .oneshot(
                    axum::http::Request::builder()
                        .method("POST")
                        .uri("/api/search")
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(payload.to_string()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            let text = body_text(resp).await;
            assert!(text.contains("error"));
        }
    }

    #[tokio::test]
    async fn search_with_both_fields_returns_json() {
        let resp = no_db_app()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/search")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({"area": "山形県", "industry": "旅館業"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let value: serde_json::Value =
            serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(value["count"], 0);
    }

    #[tokio::test]
    async fn diagnose_without_client_is_a_json_error() {
        let resp = no_db_app()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/diagnose")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({"area": "山形県", "industry": "旅館業"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let value: serde_json::Value =
            serde_json::from_str(&body_text(resp).await).unwrap();
        assert!(value["error"].is_string());
    }

    #[tokio::test]
    async fn diagnose_calls_chat_completion_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "小規模事業者持続化補助金が有力です。"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let state = AppState::new(None, Some(DiagnoseClient::new(server.uri(), "test-key")));
        let resp = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/diagnose")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "area": "山形県",
                            "industry": "旅館業",
                            "employees": "10",
                            "description": "温泉旅館の運営"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let value: serde_json::Value =
            serde_json::from_str(&body_text(resp).await).unwrap();
        assert!(value["result"]
            .as_str()
            .unwrap()
            .contains("小規模事業者持続化補助金"));
    }

    #[tokio::test]
    async fn diagnose_upstream_failure_maps_to_json_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let state = AppState::new(None, Some(DiagnoseClient::new(server.uri(), "test-key")));
        let resp = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/diagnose")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::json!({}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let value: serde_json::Value =
            serde_json::from_str(&body_text(resp).await).unwrap();
        assert!(value["error"].as_str().unwrap().contains("429"));
    }

    #[test]
    fn diagnose_prompt_lists_candidates() {
        let req = DiagnoseRequest {
            area: "山形県".to_string(),
            industry: "旅館業".to_string(),
            employees: "10".to_string(),
            description: "温泉旅館".to_string(),
        };
        let candidates = vec![WebGrant {
            id: 1,
            grant_type: "補助金".to_string(),
            title: "観光施設改修補助金".to_string(),
            organization: "山形県".to_string(),
            level: "prefecture".to_string(),
            area_prefecture: "山形県".to_string(),
            area_city: String::new(),
            industry: "旅館業".to_string(),
            target_type: "法人".to_string(),
            max_amount: "500万円".to_string(),
            subsidy_rate: "2/3".to_string(),
            url: "https://www.pref.yamagata.jp/".to_string(),
            created_at: "2026-01-01".to_string(),
        }];
        let prompt = build_diagnose_prompt(&req, &candidates);
        assert!(prompt.contains("観光施設改修補助金"));
        assert!(prompt.contains("所在地: 山形県"));

        let empty = build_diagnose_prompt(&req, &[]);
        assert!(empty.contains("候補なし"));
    }
}
