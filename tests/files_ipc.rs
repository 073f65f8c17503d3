use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use markusd::viewer::{Effect, FileMeta, FileViewer, Selection, ViewerState};

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_markusd");
    let mut child = Command::new(exe)
        .env_remove("MARKUSD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn markusd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_default()
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn grouping(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> String {
    request_ok(stdin, reader, "ws", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let student = request_ok(
        stdin,
        reader,
        "st",
        "students.create",
        json!({ "userName": "viewer", "firstName": "V", "lastName": "Iewer" }),
    );
    let assignment = request_ok(
        stdin,
        reader,
        "as",
        "assessments.create",
        json!({ "kind": "assignment", "shortIdentifier": "A1" }),
    );
    let grouping = request_ok(
        stdin,
        reader,
        "gr",
        "groupings.create",
        json!({ "assessmentId": assignment["assessmentId"], "studentId": student["studentId"] }),
    );
    grouping["groupingId"].as_str().expect("groupingId").to_string()
}

#[test]
fn files_get_reports_type_and_size_for_the_viewer() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let grouping_id = grouping(&mut stdin, &mut reader, workspace.path());

    let source = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "files.add",
        json!({ "groupingId": grouping_id, "filename": "main.py", "content": "print('hi')\n" }),
    );
    let got = request_ok(&mut stdin, &mut reader, "2", "files.get", json!({ "fileId": source["fileId"] }));
    assert_eq!(got["type"], json!("python"));
    assert_eq!(got["size"], json!(12));
    assert_eq!(got["content"], json!("print('hi')\n"));
    assert_eq!(got["tooLarge"], json!(false));

    let image = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "files.add",
        json!({ "groupingId": grouping_id, "filename": "plot.png", "mimeType": "image/png", "bytes": [137, 80, 78, 71] }),
    );
    let got = request_ok(&mut stdin, &mut reader, "4", "files.get", json!({ "fileId": image["fileId"] }));
    assert_eq!(got["type"], json!("image"));
    assert_eq!(got["content"], json!(null));

    let blob = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "files.add",
        json!({ "groupingId": grouping_id, "filename": "a.out", "bytes": [127, 69, 76, 70, 0, 255] }),
    );
    let got = request_ok(&mut stdin, &mut reader, "6", "files.get", json!({ "fileId": blob["fileId"] }));
    assert_eq!(got["type"], json!("binary"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn large_text_omits_content_unless_forced() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let grouping_id = grouping(&mut stdin, &mut reader, workspace.path());

    let big = "x".repeat(150_000);
    let added = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "files.add",
        json!({ "groupingId": grouping_id, "filename": "log.txt", "content": big }),
    );
    let got = request_ok(&mut stdin, &mut reader, "2", "files.get", json!({ "fileId": added["fileId"] }));
    assert_eq!(got["type"], json!("text"));
    assert_eq!(got["tooLarge"], json!(true));
    assert_eq!(got["content"], json!(null));

    let forced = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "files.get",
        json!({ "fileId": added["fileId"], "forceText": true, "maxContentSize": 200_000 }),
    );
    assert_eq!(forced["content"].as_str().map(|s| s.len()), Some(150_000));

    let missing = request(&mut stdin, &mut reader, "4", "files.get", json!({ "fileId": "nope" }));
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
}

fn run_fetch(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    viewer: &mut FileViewer,
    effect: Effect,
) {
    let (ticket, file_id, force_text, max_content_size) = match effect {
        Effect::FetchMeta {
            ticket,
            file_id,
            force_text,
            max_content_size,
            ..
        } => (ticket, file_id, force_text, max_content_size),
        other => panic!("expected a metadata fetch, got {:?}", other),
    };
    let meta = request_ok(
        stdin,
        reader,
        "meta",
        "files.get",
        json!({ "fileId": file_id, "forceText": force_text, "maxContentSize": max_content_size }),
    );
    let meta: FileMeta = serde_json::from_value(meta).expect("file meta");
    assert_eq!(viewer.on_meta(ticket, meta), Effect::None);
}

#[test]
fn viewer_renders_files_served_by_files_get() {
    let workspace = tempfile::tempdir().expect("temp workspace");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let grouping_id = grouping(&mut stdin, &mut reader, workspace.path());

    let text = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "files.add",
        json!({ "groupingId": grouping_id, "filename": "Main.java", "content": "class A {}\r\n" }),
    );
    let blob = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "files.add",
        json!({ "groupingId": grouping_id, "filename": "data.bin", "bytes": [104, 105, 0] }),
    );

    let mut viewer = FileViewer::new();
    let selection = |file_id: &serde_json::Value| Selection {
        course_id: "1".into(),
        assignment_id: "1".into(),
        submission_id: "1".into(),
        file_id: file_id.as_str().map(str::to_string),
        ..Selection::default()
    };

    let effect = viewer.on_selection_changed(Some(selection(&text["fileId"])));
    run_fetch(&mut stdin, &mut reader, &mut viewer, effect);
    assert_eq!(
        viewer.state(),
        &ViewerState::Text {
            file_type: "java".into(),
            content: "class A {}\n".into()
        }
    );

    let effect = viewer.on_selection_changed(Some(selection(&blob["fileId"])));
    run_fetch(&mut stdin, &mut reader, &mut viewer, effect);
    assert!(matches!(viewer.state(), ViewerState::Binary { .. }));

    let effect = viewer.force_fetch();
    run_fetch(&mut stdin, &mut reader, &mut viewer, effect);
    assert_eq!(
        viewer.state(),
        &ViewerState::Text {
            file_type: "text".into(),
            content: "hi\u{0}".into()
        }
    );

    drop(stdin);
    let _ = child.wait();
}
