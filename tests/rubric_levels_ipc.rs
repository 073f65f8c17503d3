use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

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

struct Fixture {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    _workspace: tempfile::TempDir,
    assignment_id: String,
    grouping_id: String,
    next_id: u32,
}

impl Fixture {
    fn new() -> Self {
        let workspace = tempfile::tempdir().expect("temp workspace");
        let (child, mut stdin, mut reader) = spawn_sidecar();
        request_ok(
            &mut stdin,
            &mut reader,
            "ws",
            "workspace.select",
            json!({ "path": workspace.path().to_string_lossy() }),
        );
        let student = request_ok(
            &mut stdin,
            &mut reader,
            "st",
            "students.create",
            json!({ "userName": "s1", "firstName": "Sam", "lastName": "One" }),
        );
        let assignment = request_ok(
            &mut stdin,
            &mut reader,
            "as",
            "assessments.create",
            json!({ "kind": "assignment", "shortIdentifier": "A1" }),
        );
        let assignment_id = assignment["assessmentId"].as_str().expect("assessmentId").to_string();
        let grouping = request_ok(
            &mut stdin,
            &mut reader,
            "gr",
            "groupings.create",
            json!({ "assessmentId": assignment_id, "studentId": student["studentId"] }),
        );
        let grouping_id = grouping["groupingId"].as_str().expect("groupingId").to_string();
        Self {
            child,
            stdin,
            reader,
            _workspace: workspace,
            assignment_id,
            grouping_id,
            next_id: 0,
        }
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = format!("r{}", self.next_id);
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = format!("r{}", self.next_id);
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn criterion(&mut self, name: &str, max_mark: f64) -> serde_json::Value {
        let assignment_id = self.assignment_id.clone();
        self.ok(
            "criteria.create",
            json!({ "assessmentId": assignment_id, "name": name, "maxMark": max_mark }),
        )["criterion"]
            .clone()
    }

    fn levels(&mut self, criterion_id: &str) -> Vec<serde_json::Value> {
        let assignment_id = self.assignment_id.clone();
        let listed = self.ok("criteria.list", json!({ "assessmentId": assignment_id }));
        listed["criteria"]
            .as_array()
            .expect("criteria")
            .iter()
            .find(|c| c["criterion"]["id"] == json!(criterion_id))
            .expect("criterion listed")["criterion"]["levels"]
            .as_array()
            .expect("levels")
            .clone()
    }

    fn result_with_mark(&mut self, criterion_id: &str, mark: f64) -> String {
        let grouping_id = self.grouping_id.clone();
        let result = self.ok("results.create", json!({ "groupingId": grouping_id }));
        let result_id = result["resultId"].as_str().expect("resultId").to_string();
        self.ok(
            "marks.set",
            json!({ "resultId": result_id, "criterionId": criterion_id, "mark": mark }),
        );
        result_id
    }

    fn mark(&mut self, result_id: &str, criterion_id: &str) -> serde_json::Value {
        let listed = self.ok("marks.list", json!({ "resultId": result_id }));
        listed["marks"]
            .as_array()
            .expect("marks")
            .iter()
            .find(|m| m["criterionId"] == json!(criterion_id))
            .expect("mark row")["mark"]
            .clone()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn marks_of(levels: &[serde_json::Value]) -> Vec<f64> {
    levels
        .iter()
        .map(|l| l["mark"].as_f64().expect("level mark"))
        .collect()
}

#[test]
fn new_criterion_gets_five_levels_spread_over_max_mark() {
    let mut fx = Fixture::new();
    let criterion = fx.criterion("Correctness", 4.0);
    let levels = criterion["levels"].as_array().expect("levels");
    assert_eq!(marks_of(levels), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    assert_eq!(levels[0]["name"], json!("Very Poor"));
    assert_eq!(levels[4]["name"], json!("Excellent"));
}

#[test]
fn rescale_skips_overridden_levels_and_carries_marks() {
    let mut fx = Fixture::new();
    let criterion = fx.criterion("Design", 4.0);
    let criterion_id = criterion["id"].as_str().expect("id").to_string();

    let updated = fx.ok("criteria.update", json!({ "criterionId": criterion_id, "maxMark": 8.0 }));
    assert_eq!(
        marks_of(updated["criterion"]["levels"].as_array().expect("levels")),
        vec![0.0, 2.0, 4.0, 6.0, 8.0]
    );

    let result_id = fx.result_with_mark(&criterion_id, 2.0);
    let level_one = fx.levels(&criterion_id)[1]["id"].as_str().expect("level id").to_string();
    let level = fx.ok("levels.update", json!({ "levelId": level_one, "mark": 3.0 }));
    assert_eq!(level["level"]["markOverridden"], json!(true));
    assert_eq!(fx.mark(&result_id, &criterion_id), json!(3.0));

    fx.ok("criteria.update", json!({ "criterionId": criterion_id, "maxMark": 16.0 }));
    assert_eq!(marks_of(&fx.levels(&criterion_id)), vec![0.0, 3.0, 8.0, 12.0, 16.0]);
    assert_eq!(fx.mark(&result_id, &criterion_id), json!(3.0));
}

#[test]
fn batch_update_with_duplicate_mark_changes_nothing() {
    let mut fx = Fixture::new();
    let criterion = fx.criterion("Tests", 4.0);
    let criterion_id = criterion["id"].as_str().expect("id").to_string();
    let before = fx.levels(&criterion_id);

    let mut edits = serde_json::Map::new();
    for (i, l) in before.iter().enumerate() {
        edits.insert(
            i.to_string(),
            json!({ "id": l["id"], "name": l["name"], "mark": if i == 1 { 2.0 } else { l["mark"].as_f64().unwrap_or(0.0) } }),
        );
    }
    let rejected = fx.call(
        "levels.updateBatch",
        json!({ "criterionId": criterion_id, "levels": edits }),
    );
    assert_eq!(error_code(&rejected), "validation_failed");
    assert_eq!(fx.levels(&criterion_id), before);
}

#[test]
fn swapping_level_marks_moves_each_mark_once() {
    let mut fx = Fixture::new();
    let criterion = fx.criterion("Swap", 4.0);
    let criterion_id = criterion["id"].as_str().expect("id").to_string();
    let low = fx.result_with_mark(&criterion_id, 1.0);
    let high = fx.result_with_mark(&criterion_id, 3.0);

    let levels = fx.levels(&criterion_id);
    let mut edits = serde_json::Map::new();
    for (i, l) in levels.iter().enumerate() {
        let mark = match i {
            1 => 3.0,
            3 => 1.0,
            _ => l["mark"].as_f64().expect("mark"),
        };
        edits.insert(
            format!("k{}", i),
            json!({ "id": l["id"], "name": l["name"], "description": l["description"], "mark": mark }),
        );
    }
    let applied = fx.ok(
        "levels.updateBatch",
        json!({ "criterionId": criterion_id, "levels": edits }),
    );
    assert_eq!(applied["updated"], json!(2));
    assert_eq!(fx.mark(&low, &criterion_id), json!(3.0));
    assert_eq!(fx.mark(&high, &criterion_id), json!(1.0));
}

#[test]
fn deleting_a_level_clears_marks_at_its_value() {
    let mut fx = Fixture::new();
    let criterion = fx.criterion("Docs", 4.0);
    let criterion_id = criterion["id"].as_str().expect("id").to_string();
    let hit = fx.result_with_mark(&criterion_id, 2.0);
    let miss = fx.result_with_mark(&criterion_id, 4.0);

    let level_two = fx.levels(&criterion_id)[2]["id"].as_str().expect("id").to_string();
    fx.ok("levels.delete", json!({ "levelId": level_two }));

    assert_eq!(fx.levels(&criterion_id).len(), 4);
    assert_eq!(fx.mark(&hit, &criterion_id), json!(null));
    assert_eq!(fx.mark(&miss, &criterion_id), json!(4.0));
}

#[test]
fn released_results_lock_the_criterion() {
    let mut fx = Fixture::new();
    let criterion = fx.criterion("Locked", 4.0);
    let criterion_id = criterion["id"].as_str().expect("id").to_string();
    let result_id = fx.result_with_mark(&criterion_id, 1.0);
    fx.ok("results.release", json!({ "resultId": result_id }));

    let before = fx.levels(&criterion_id);
    let rescale = fx.call("criteria.update", json!({ "criterionId": criterion_id, "maxMark": 10.0 }));
    assert_eq!(error_code(&rescale), "released");
    let level_id = before[0]["id"].as_str().expect("id").to_string();
    let rename = fx.call("levels.update", json!({ "levelId": level_id, "name": "Zero" }));
    assert_eq!(error_code(&rename), "released");
    let remark = fx.call(
        "marks.set",
        json!({ "resultId": result_id, "criterionId": criterion_id, "mark": 2.0 }),
    );
    assert_eq!(error_code(&remark), "released");
    let reset = fx.call("levels.setDefaults", json!({ "criterionId": criterion_id }));
    assert_eq!(error_code(&reset), "released");
    let removed = fx.call("criteria.delete", json!({ "criterionId": criterion_id }));
    assert_eq!(error_code(&removed), "released");

    let assignment_id = fx.assignment_id.clone();
    let imported = fx.ok(
        "criteria.importCsvRows",
        json!({
            "assessmentId": assignment_id,
            "rows": [["Locked", "6", "only", "", "1"]]
        }),
    );
    assert_eq!(imported["imported"], json!([]));
    assert_eq!(imported["errors"][0]["code"], json!("released"));

    assert_eq!(fx.levels(&criterion_id), before);
    assert_eq!(fx.mark(&result_id, &criterion_id), json!(1.0));
}

#[test]
fn csv_rows_replace_levels_and_report_bad_rows() {
    let mut fx = Fixture::new();
    let criterion = fx.criterion("crit", 4.0);
    let criterion_id = criterion["id"].as_str().expect("id").to_string();
    let assignment_id = fx.assignment_id.clone();

    // Drop to three levels first.
    let levels = fx.levels(&criterion_id);
    for l in &levels[3..] {
        fx.ok("levels.delete", json!({ "levelId": l["id"] }));
    }
    assert_eq!(fx.levels(&criterion_id).len(), 3);

    let imported = fx.ok(
        "criteria.importCsvRows",
        json!({
            "assessmentId": assignment_id,
            "rows": [
                ["crit", "5.0", "a", "d0", "10", "b", "d1", "11"],
                ["broken"],
                ["other", "3", "x", "", "-1"],
                ["fresh", "2", "only", "desc", "2"]
            ]
        }),
    );
    assert_eq!(imported["imported"].as_array().map(|a| a.len()), Some(2));
    let errors = imported["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0]["row"], json!(1));
    assert_eq!(errors[0]["code"], json!("csv_invalid_line"));
    assert_eq!(errors[1]["row"], json!(2));
    assert_eq!(errors[1]["code"], json!("bad_argument"));

    let levels = fx.levels(&criterion_id);
    assert_eq!(levels.len(), 2);
    assert_eq!(levels[0]["name"], json!("a"));
    assert_eq!(levels[0]["description"], json!("d0"));
    assert_eq!(levels[0]["mark"], json!(10.0));
    assert_eq!(levels[1]["name"], json!("b"));
    assert_eq!(levels[1]["description"], json!("d1"));
    assert_eq!(levels[1]["mark"], json!(11.0));

    let listed = fx.ok("criteria.list", json!({ "assessmentId": assignment_id }));
    let names: Vec<&str> = listed["criteria"]
        .as_array()
        .expect("criteria")
        .iter()
        .filter_map(|c| c["criterion"]["name"].as_str())
        .collect();
    assert_eq!(names, vec!["crit", "fresh"]);
}

#[test]
fn closest_level_and_default_reset() {
    let mut fx = Fixture::new();
    let criterion = fx.criterion("Near", 8.0);
    let criterion_id = criterion["id"].as_str().expect("id").to_string();

    let closest = fx.ok("criteria.closestLevel", json!({ "criterionId": criterion_id, "mark": 5.1 }));
    assert_eq!(closest["level"]["mark"], json!(6.0));

    let reset = fx.ok("levels.setDefaults", json!({ "criterionId": criterion_id }));
    assert_eq!(
        marks_of(reset["criterion"]["levels"].as_array().expect("levels")),
        vec![0.0, 1.0, 2.0, 3.0, 4.0]
    );

    let missing = fx.call("criteria.closestLevel", json!({ "criterionId": "nope", "mark": 1.0 }));
    assert_eq!(error_code(&missing), "not_found");
}

#[test]
fn deleting_a_criterion_removes_its_marks() {
    let mut fx = Fixture::new();
    let keep = fx.criterion("Keep", 4.0);
    let gone = fx.criterion("Gone", 4.0);
    let keep_id = keep["id"].as_str().expect("id").to_string();
    let gone_id = gone["id"].as_str().expect("id").to_string();
    let result_id = fx.result_with_mark(&gone_id, 2.0);

    fx.ok("criteria.delete", json!({ "criterionId": gone_id }));
    let listed = fx.ok("marks.list", json!({ "resultId": result_id }));
    let ids: Vec<&str> = listed["marks"]
        .as_array()
        .expect("marks")
        .iter()
        .filter_map(|m| m["criterionId"].as_str())
        .collect();
    assert_eq!(ids, vec![keep_id.as_str()]);
}
