use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::results::grouping_exists;
use crate::ipc::params::{opt_bool, opt_i64, opt_str, req_non_empty, req_str};
use crate::ipc::types::{AppState, Request};
use crate::viewer::{is_file_too_large, MAX_SIZE_TEXT, TYPE_BINARY, TYPE_IMAGE, TYPE_NOTEBOOK, TYPE_PDF, TYPE_URL};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn extension_of(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Viewer type for a stored file: a rendered kind, a url, binary, or the
/// highlighting language for text.
pub fn classify_file(filename: &str, mime_type: Option<&str>, bytes: &[u8], force_text: bool) -> String {
    let ext = extension_of(filename);
    let mime = mime_type.unwrap_or("");

    if ext == "pdf" || mime == "application/pdf" {
        return TYPE_PDF.to_string();
    }
    if mime.starts_with("image/")
        || matches!(
            ext.as_str(),
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" | "svg" | "heic" | "heif"
        )
    {
        return TYPE_IMAGE.to_string();
    }
    if ext == "ipynb" {
        return TYPE_NOTEBOOK.to_string();
    }
    if ext == "markusurl" {
        return TYPE_URL.to_string();
    }
    if !force_text && (std::str::from_utf8(bytes).is_err() || bytes.contains(&0)) {
        return TYPE_BINARY.to_string();
    }
    match ext.as_str() {
        "py" => "python",
        "java" => "java",
        "rb" => "ruby",
        "js" | "jsx" | "ts" | "tsx" => "javascript",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "hs" => "haskell",
        "scm" | "rkt" | "ss" => "scheme",
        "rs" => "rust",
        "md" => "markdown",
        _ => "text",
    }
    .to_string()
}

fn handle_files_add(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let grouping_id = req_str(req, "groupingId")?;
    let filename = req_non_empty(req, "filename")?;
    let mime_type = opt_str(req, "mimeType")?;
    let bytes: Vec<u8> = match (req.params.get("content"), req.params.get("bytes")) {
        (Some(serde_json::Value::String(s)), _) => s.clone().into_bytes(),
        (_, Some(v)) => serde_json::from_value(v.clone())
            .map_err(|e| HandlerErr::bad_params(format!("invalid bytes: {e}")))?,
        _ => return Err(HandlerErr::bad_params("missing content or bytes")),
    };
    if !grouping_exists(conn, &grouping_id)? {
        return Err(HandlerErr::not_found("grouping not found"));
    }

    let file_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO submission_files(id, grouping_id, filename, mime_type, content, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &file_id,
            &grouping_id,
            &filename,
            &mime_type,
            &bytes,
            chrono::Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(json!({ "fileId": file_id, "size": bytes.len() }))
}

/// Metadata and (small enough) content for the file viewer.
fn handle_files_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let file_id = req_str(req, "fileId")?;
    let force_text = opt_bool(req, "forceText")?.unwrap_or(false);
    let max_content_size = opt_i64(req, "maxContentSize")?
        .map(|v| v.max(0) as u64)
        .unwrap_or(MAX_SIZE_TEXT);

    let row: Option<(String, Option<String>, Vec<u8>)> = conn
        .query_row(
            "SELECT filename, mime_type, content FROM submission_files WHERE id = ?",
            [&file_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((filename, mime_type, bytes)) = row else {
        return Err(HandlerErr::not_found("submission file not found")
            .with_details(json!({ "fileId": file_id })));
    };

    let file_type = classify_file(&filename, mime_type.as_deref(), &bytes, force_text);
    let size = bytes.len() as u64;
    let content = match file_type.as_str() {
        TYPE_IMAGE | TYPE_PDF | TYPE_NOTEBOOK => None,
        TYPE_BINARY => Some(format!("{filename} is a binary file ({size} bytes)")),
        _ if size > max_content_size && !force_text => None,
        _ => Some(String::from_utf8_lossy(&bytes).into_owned()),
    };

    Ok(json!({
        "size": size,
        "type": file_type,
        "mimeType": mime_type,
        "tooLarge": is_file_too_large(size, &file_type),
        "content": content
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "files.add" => handle_files_add(state, req),
        "files.get" => handle_files_get(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
