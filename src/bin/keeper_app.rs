use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post, put};
use clap::{CommandFactory, Parser};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use keeper::modules::blob::HttpBlobClient;
use keeper::modules::serialize::{KeeperConfig, load_run_config, load_snapshot_file, parse_snapshot};
use keeper::modules::store::{StoreError, UrlStore};
use keeper::modules::types::{RecordDraft, RecordPatch, UrlRecord, UrlTable};

#[derive(Clone)]
struct AppState {
    store: Arc<Mutex<UrlStore<HttpBlobClient>>>,
    config: Arc<KeeperConfig>,
    log_path: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "keeper_app",
    version,
    about = "URL keeper admin panel",
    long_about = None
)]
struct Cli {
    #[arg(short = 'l', long = "log-file", default_value = "keeper.log")]
    log_file: String,

    #[arg(short = 'c', long = "config", default_value = "./keeper.toml")]
    config: String,
}

fn main() {
    if std::env::args_os().len() == 1 {
        let mut cmd = Cli::command();
        cmd.print_long_help().expect("help output failed");
        println!();
        return;
    }

    let cli = Cli::parse();
    // The snapshot fetch and the sink use reqwest's blocking client, which
    // must not run inside the async runtime; all setup happens before it
    // starts.
    let config = load_run_config(&cli.config).expect("failed to load keeper.toml");
    let snapshot = fetch_snapshot(&config).expect("failed to load snapshot");
    let (tables, shape) = parse_snapshot(snapshot).expect("snapshot is malformed");
    let sink = HttpBlobClient::new(&config.backend_url).expect("invalid backend url");
    let store = UrlStore::new(
        tables,
        shape,
        sink,
        config.container.clone(),
        config.blob.clone(),
    );

    let state = AppState {
        store: Arc::new(Mutex::new(store)),
        config: Arc::new(config),
        log_path: PathBuf::from(cli.log_file),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start runtime");
    runtime.block_on(serve(state));
}

async fn serve(state: AppState) {
    let app = Router::new()
        .route("/", get(index))
        .route("/api/tables", get(list_tables).put(replace_tables))
        .route("/api/tables/:idx/records", post(add_record))
        .route(
            "/api/tables/:idx/records/:id",
            put(update_record).delete(delete_record),
        )
        .route("/api/reload", post(reload))
        .route("/api/log", get(get_log))
        .with_state(state);

    let port = env::var("KEEPER_APP_PORT")
        .ok()
        .and_then(|val| val.parse::<u16>().ok())
        .unwrap_or(7890);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    println!("Keeper app running on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind port");
    axum::serve(listener, app)
        .await
        .expect("server error");
}

async fn index() -> Html<String> {
    Html(index_html())
}

async fn list_tables(State(state): State<AppState>) -> Result<Json<Vec<UrlTable>>, ApiError> {
    let store = lock_store(&state)?;
    Ok(Json(store.tables().to_vec()))
}

async fn replace_tables(
    State(state): State<AppState>,
    Json(tables): Json<Vec<UrlTable>>,
) -> Result<Json<Vec<UrlTable>>, ApiError> {
    let store = state.store.clone();
    let tables = tokio::task::spawn_blocking(move || -> Result<Vec<UrlTable>, ApiError> {
        let mut store = store
            .lock()
            .map_err(|_| ApiError::internal("store lock poisoned".to_string()))?;
        store.replace_all(tables)?;
        Ok(store.tables().to_vec())
    })
    .await
    .map_err(|err| ApiError::internal(err.to_string()))??;
    Ok(Json(tables))
}

async fn add_record(
    State(state): State<AppState>,
    Path(idx): Path<usize>,
    Json(draft): Json<RecordDraft>,
) -> Result<Json<UrlRecord>, ApiError> {
    let store = state.store.clone();
    let record = tokio::task::spawn_blocking(move || -> Result<UrlRecord, ApiError> {
        let mut store = store
            .lock()
            .map_err(|_| ApiError::internal("store lock poisoned".to_string()))?;
        Ok(store.add_record(idx, draft)?)
    })
    .await
    .map_err(|err| ApiError::internal(err.to_string()))??;
    Ok(Json(record))
}

async fn update_record(
    State(state): State<AppState>,
    Path((idx, id)): Path<(usize, u64)>,
    Json(patch): Json<RecordPatch>,
) -> Result<Json<UrlRecord>, ApiError> {
    let store = state.store.clone();
    let record = tokio::task::spawn_blocking(move || -> Result<UrlRecord, ApiError> {
        let mut store = store
            .lock()
            .map_err(|_| ApiError::internal("store lock poisoned".to_string()))?;
        Ok(store.update_record(idx, id, patch)?)
    })
    .await
    .map_err(|err| ApiError::internal(err.to_string()))??;
    Ok(Json(record))
}

async fn delete_record(
    State(state): State<AppState>,
    Path((idx, id)): Path<(usize, u64)>,
) -> Result<StatusCode, ApiError> {
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || -> Result<(), ApiError> {
        let mut store = store
            .lock()
            .map_err(|_| ApiError::internal("store lock poisoned".to_string()))?;
        Ok(store.delete_record(idx, id)?)
    })
    .await
    .map_err(|err| ApiError::internal(err.to_string()))??;
    Ok(StatusCode::NO_CONTENT)
}

/// Refetches the snapshot and adopts it without persisting. This is the
/// recovery path after a failed persist: the remote blob stays the source
/// of truth.
async fn reload(State(state): State<AppState>) -> Result<Json<Vec<UrlTable>>, ApiError> {
    let config = state.config.clone();
    let store = state.store.clone();
    let tables = tokio::task::spawn_blocking(move || -> Result<Vec<UrlTable>, ApiError> {
        let snapshot = fetch_snapshot(&config)?;
        let (tables, shape) =
            parse_snapshot(snapshot).map_err(|err| ApiError::internal(err.to_string()))?;
        let mut store = store
            .lock()
            .map_err(|_| ApiError::internal("store lock poisoned".to_string()))?;
        store.reset(tables.clone(), shape);
        Ok(tables)
    })
    .await
    .map_err(|err| ApiError::internal(err.to_string()))??;
    Ok(Json(tables))
}

async fn get_log(State(state): State<AppState>) -> Result<String, ApiError> {
    let text = match fs::read_to_string(&state.log_path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(ApiError::internal(err.to_string())),
    };
    Ok(limit_tail(&text, 20000))
}

fn fetch_snapshot(config: &KeeperConfig) -> Result<serde_json::Value, ApiError> {
    if let Some(url) = &config.snapshot_url {
        let client = HttpBlobClient::new(&config.backend_url)
            .map_err(|err| ApiError::internal(err.to_string()))?;
        return client
            .fetch_document(url)
            .map_err(|err| ApiError::bad_gateway(err.to_string()));
    }
    if let Some(path) = &config.snapshot_file {
        return load_snapshot_file(path).map_err(|err| ApiError::internal(err.to_string()));
    }
    Err(ApiError::internal(
        "keeper.toml must set snapshot_url or snapshot_file".to_string(),
    ))
}

fn lock_store(
    state: &AppState,
) -> Result<std::sync::MutexGuard<'_, UrlStore<HttpBlobClient>>, ApiError> {
    state
        .store
        .lock()
        .map_err(|_| ApiError::internal("store lock poisoned".to_string()))
}

fn limit_tail(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    // Log lines carry user-supplied source strings, so the cut can land
    // inside a multibyte character; move it forward to the next boundary.
    let mut start = text.len() - max_chars;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[derive(Debug)]
struct ApiError {
    code: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: String) -> Self {
        Self {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }

    fn bad_gateway(message: String) -> Self {
        Self {
            code: StatusCode::BAD_GATEWAY,
            message,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::EmptyField(_) | StoreError::ShapeMismatch => StatusCode::BAD_REQUEST,
            StoreError::UnknownTable(_) | StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Persist(_) => StatusCode::BAD_GATEWAY,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.code, self.message).into_response()
    }
}

fn index_html() -> String {
    let html = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>URL Keeper</title>
  <style>
    :root {
      --bg: #0f172a;
      --panel: #0b1324;
      --card: #0f1c33;
      --accent: #38bdf8;
      --text: #e2e8f0;
      --muted: #94a3b8;
      --border: rgba(148, 163, 184, 0.2);
      --danger: #ef4444;
      --ok: #22c55e;
    }

    * { box-sizing: border-box; }

    body {
      margin: 0;
      font-family: "Trebuchet MS", "Verdana", "Geneva", sans-serif;
      color: var(--text);
      background: radial-gradient(circle at top, #1e293b, #0b1020 55%, #090c18);
      min-height: 100vh;
    }

    header { padding: 24px 20px 12px; }
    header h1 { margin: 0 0 6px; font-size: 28px; letter-spacing: 0.5px; }
    header p { margin: 0; color: var(--muted); font-size: 14px; }

    .shell { padding: 0 16px 32px; max-width: 1000px; margin: 0 auto; }

    .tabs { display: flex; gap: 8px; margin-bottom: 16px; }

    .tab {
      border: 1px solid var(--border);
      padding: 10px 16px;
      border-radius: 999px;
      background: rgba(15, 23, 42, 0.6);
      color: var(--text);
      cursor: pointer;
    }

    .tab.active { background: var(--accent); color: #0b1020; border-color: transparent; }

    .panel {
      background: linear-gradient(145deg, rgba(15, 23, 42, 0.9), rgba(17, 24, 39, 0.95));
      border: 1px solid var(--border);
      border-radius: 18px;
      padding: 20px;
    }

    .table-section { margin-bottom: 24px; }
    .table-section h2 { margin: 0 0 10px; font-size: 18px; color: var(--accent); }

    .row {
      display: grid;
      grid-template-columns: 70px 180px 1fr auto auto;
      gap: 10px;
      align-items: center;
      padding: 8px;
      border-bottom: 1px solid var(--border);
    }

    .row.head { color: var(--muted); font-size: 12px; text-transform: uppercase; }

    .row input[type="text"] {
      width: 100%;
      padding: 8px 10px;
      border-radius: 8px;
      border: 1px solid transparent;
      background: var(--panel);
      color: var(--text);
    }

    .row input[type="text"]:focus { outline: none; border-color: var(--accent); }

    .btn {
      border: 1px solid transparent;
      padding: 8px 14px;
      border-radius: 10px;
      cursor: pointer;
      font-weight: 600;
      background: var(--accent);
      color: #0b1020;
    }

    .btn.secondary { background: transparent; color: var(--text); border-color: var(--border); }
    .btn.danger { background: var(--danger); color: #111827; }

    .notice {
      padding: 10px 14px;
      border-radius: 12px;
      background: rgba(34, 197, 94, 0.15);
      color: #bbf7d0;
      border: 1px solid rgba(34, 197, 94, 0.3);
      display: none;
      margin-bottom: 14px;
    }

    .notice.error {
      background: rgba(239, 68, 68, 0.15);
      color: #fecaca;
      border-color: rgba(239, 68, 68, 0.3);
    }

    .log-box {
      background: #0b1020;
      border-radius: 12px;
      padding: 14px;
      border: 1px solid var(--border);
      color: #d1d5db;
      font-family: "Courier New", monospace;
      font-size: 12px;
      white-space: pre-wrap;
      max-height: 460px;
      overflow-y: auto;
    }

    .empty { color: var(--muted); padding: 12px 8px; }
  </style>
</head>
<body>
  <header>
    <div class="shell">
      <h1>URL Keeper</h1>
      <p>Edit the URL tables behind the blob and review harvest logs.</p>
    </div>
  </header>
  <div class="shell">
    <div class="tabs">
      <button class="tab active" data-tab="tables">Tables</button>
      <button class="tab" data-tab="log">Log</button>
      <button class="tab" id="reload-btn">Reload from blob</button>
    </div>

    <div class="notice" id="notice"></div>

    <div class="panel" id="panel-body"></div>
  </div>

  <script>
    const notice = document.getElementById("notice");
    const panelBody = document.getElementById("panel-body");
    const state = { tables: [], log: "", tab: "tables" };

    function showNotice(message, isError = false) {
      notice.textContent = message;
      notice.classList.toggle("error", isError);
      notice.style.display = "block";
      setTimeout(() => { notice.style.display = "none"; }, 3500);
    }

    function escapeHtml(unsafe) {
      return String(unsafe)
        .replace(/&/g, "&amp;")
        .replace(/</g, "&lt;")
        .replace(/>/g, "&gt;")
        .replace(/"/g, "&quot;")
        .replace(/'/g, "&#039;");
    }

    async function apiGet(path) {
      const res = await fetch(path);
      if (!res.ok) { throw new Error(await res.text()); }
      return res.json();
    }

    async function apiSend(path, method, payload) {
      const res = await fetch(path, {
        method,
        headers: { "Content-Type": "application/json" },
        body: payload === undefined ? undefined : JSON.stringify(payload)
      });
      if (!res.ok) { throw new Error(await res.text()); }
      return res;
    }

    async function loadTables() {
      state.tables = await apiGet("/api/tables");
    }

    function recordRow(tableIndex, record) {
      return `
        <div class="row" data-table="${tableIndex}" data-id="${record.id}">
          <input type="checkbox" data-field="active" ${record.active ? "checked" : ""} />
          <input type="text" data-field="source" value="${escapeHtml(record.source)}" />
          <input type="text" data-field="url" value="${escapeHtml(record.url)}" />
          <button class="btn" data-action="save">Save</button>
          <button class="btn danger" data-action="delete">Delete</button>
        </div>
      `;
    }

    function addRow(tableIndex) {
      return `
        <div class="row" data-table="${tableIndex}" data-new="1">
          <input type="checkbox" data-field="active" checked />
          <input type="text" data-field="source" placeholder="source" />
          <input type="text" data-field="url" placeholder="http://..." />
          <button class="btn secondary" data-action="add">Add</button>
          <span></span>
        </div>
      `;
    }

    function renderTables() {
      if (!state.tables.length) {
        panelBody.innerHTML = `<div class="empty">No tables in the snapshot.</div>`;
        return;
      }
      panelBody.innerHTML = state.tables.map((table, tableIndex) => `
        <div class="table-section">
          <h2>${escapeHtml(table.title)}</h2>
          <div class="row head"><span>Active</span><span>Source</span><span>URL</span><span></span><span></span></div>
          ${table.data.length
            ? table.data.map(record => recordRow(tableIndex, record)).join("")
            : `<div class="empty">No URLs yet.</div>`}
          ${addRow(tableIndex)}
        </div>
      `).join("");
    }

    function renderLog() {
      panelBody.innerHTML = `<div class="log-box" id="log-box">${escapeHtml(state.log || "No log entries yet.")}</div>`;
    }

    function render() {
      if (state.tab === "log") { renderLog(); } else { renderTables(); }
    }

    function rowPayload(row) {
      return {
        active: row.querySelector('[data-field="active"]').checked,
        source: row.querySelector('[data-field="source"]').value.trim(),
        url: row.querySelector('[data-field="url"]').value.trim()
      };
    }

    panelBody.addEventListener("click", async (e) => {
      const action = e.target.dataset.action;
      if (!action) return;
      const row = e.target.closest(".row");
      const tableIndex = row.dataset.table;
      try {
        if (action === "add") {
          const payload = rowPayload(row);
          if (!payload.source || !payload.url) {
            showNotice("Please fill in source and URL", true);
            return;
          }
          await apiSend(`/api/tables/${tableIndex}/records`, "POST", payload);
          showNotice("URL added");
        } else if (action === "save") {
          await apiSend(`/api/tables/${tableIndex}/records/${row.dataset.id}`, "PUT", rowPayload(row));
          showNotice("URL saved");
        } else if (action === "delete") {
          if (!window.confirm("Delete this URL?")) return;
          await apiSend(`/api/tables/${tableIndex}/records/${row.dataset.id}`, "DELETE");
          showNotice("URL deleted");
        }
        await loadTables();
        render();
      } catch (err) {
        showNotice(err.message, true);
      }
    });

    document.querySelectorAll(".tab[data-tab]").forEach(btn => {
      btn.addEventListener("click", async () => {
        state.tab = btn.dataset.tab;
        document.querySelectorAll(".tab[data-tab]").forEach(b => {
          b.classList.toggle("active", b.dataset.tab === state.tab);
        });
        if (state.tab === "log") {
          const res = await fetch("/api/log");
          state.log = res.ok ? await res.text() : "";
        }
        render();
      });
    });

    document.getElementById("reload-btn").addEventListener("click", async () => {
      try {
        const res = await apiSend("/api/reload", "POST");
        state.tables = await res.json();
        state.tab = "tables";
        render();
        showNotice("Reloaded from blob");
      } catch (err) {
        showNotice(err.message, true);
      }
    });

    loadTables().then(render).catch(err => showNotice(err.message, true));
  </script>
</body>
</html>
"#;
    html.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    const SNAPSHOT: &str = r#"[{"id":1,"active":true,"source":"a","url":"http://x/1"}]"#;

    /// Serves one HTTP response on an ephemeral port and returns its URL.
    fn serve_snapshot_once(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let addr = listener.local_addr().expect("test listener addr");
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/data/urls.json")
    }

    fn config_with(snapshot_url: String) -> KeeperConfig {
        KeeperConfig {
            backend_url: "http://localhost:7071".to_string(),
            container: "data".to_string(),
            blob: "urls.json".to_string(),
            snapshot_url: Some(snapshot_url),
            snapshot_file: None,
        }
    }

    // Startup runs fetch_snapshot before the runtime exists; the blocking
    // client is only legal there or behind spawn_blocking.
    #[test]
    fn startup_snapshot_fetch_works_outside_the_runtime() {
        let url = serve_snapshot_once(SNAPSHOT);
        let snapshot = fetch_snapshot(&config_with(url)).expect("snapshot fetch");
        let (tables, _) = parse_snapshot(snapshot).expect("snapshot parse");
        assert_eq!(tables[0].records[0].id, 1);
    }

    #[tokio::test]
    async fn snapshot_fetch_inside_the_runtime_goes_through_spawn_blocking() {
        let url = serve_snapshot_once(SNAPSHOT);
        let config = config_with(url);
        let snapshot = tokio::task::spawn_blocking(move || fetch_snapshot(&config))
            .await
            .expect("blocking task")
            .expect("snapshot fetch");
        let (tables, _) = parse_snapshot(snapshot).expect("snapshot parse");
        assert_eq!(tables[0].records.len(), 1);
    }

    #[test]
    fn log_tail_respects_char_boundaries() {
        assert_eq!(limit_tail("aaaübbbb", 5), "bbbb");
        assert_eq!(limit_tail("aaaübbbb", 20), "aaaübbbb");
        assert_eq!(limit_tail("ééééé", 3), "é");
    }
}
