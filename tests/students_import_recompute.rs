use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .env_remove("GRADEBOOKD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": method,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(method));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, method, params);
    assert_eq!(value["ok"], json!(true), "{} failed: {}", method, value);
    value["result"].clone()
}

fn write_csv(dir: &Path, name: &str, body: &str) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, body).expect("write csv");
    p
}

fn find_by_name<'a>(students: &'a serde_json::Value, name: &str) -> &'a serde_json::Value {
    students
        .as_array()
        .expect("students array")
        .iter()
        .find(|s| s["values"]["姓名"].as_str() == Some(name))
        .unwrap_or_else(|| panic!("student {} not listed", name))
}

fn approx(v: &serde_json::Value, expected: f64) {
    let got = v.as_f64().expect("number");
    assert!((got - expected).abs() < 1e-9, "got {}, expected {}", got, expected);
}

const GRADES_CSV: &str = "\u{feff}学号,姓名,语文,数学,英语 (笔试)
2023001,张三,90,优秀,54/65
2023002,李四,,不及格,0
2023003,王五,良,85.5
2023004,赵六,,,
,,,,
2023005,钱七,70,80,90,extra
";

#[test]
fn import_then_recompute_fills_derived_totals() {
    let workspace = temp_dir("gradebook-import");
    let csv_path = write_csv(&workspace, "data.csv", GRADES_CSV);
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "students.importCsv",
        json!({ "path": csv_path.to_string_lossy() }),
    );
    assert_eq!(summary["imported"], json!(5));
    assert_eq!(summary["blankRows"], json!(1));
    assert_eq!(summary["schemaCreated"], json!(true));
    let keys: Vec<&str> = summary["columns"]
        .as_array()
        .expect("columns")
        .iter()
        .map(|c| c["key"].as_str().expect("key"))
        .collect();
    assert_eq!(keys, vec!["学号", "姓名", "语文", "数学", "英语__笔试"]);

    // Nothing is computed on import.
    let listed = request_ok(&mut stdin, &mut reader, "students.list", json!({}));
    let students = &listed["students"];
    assert_eq!(students.as_array().map(|a| a.len()), Some(5));
    let wang = find_by_name(students, "王五");
    assert_eq!(wang["fields"], json!(["2023003", "王五", "良", "85.5", ""]));
    assert!(wang["computedAt"].is_null());
    approx(&wang["totalScore"], 0.0);
    let qian = find_by_name(students, "钱七");
    assert_eq!(qian["fields"].as_array().map(|a| a.len()), Some(5));

    let recomputed = request_ok(&mut stdin, &mut reader, "stats.recompute", json!({}));
    assert_eq!(recomputed["students"], json!(5));
    assert_eq!(recomputed["gradedFields"], json!(3 + 2 + 2 + 3));

    let listed = request_ok(&mut stdin, &mut reader, "students.list", json!({}));
    let students = &listed["students"];

    let zhang = find_by_name(students, "张三");
    approx(&zhang["totalScore"], 250.0);
    approx(&zhang["averageScore"], 83.33);
    assert_eq!(zhang["gradedCount"], json!(3));
    assert!(zhang["computedAt"].is_string());

    // "不及格" contains "及格", which the table lists first.
    let li = find_by_name(students, "李四");
    approx(&li["totalScore"], 60.0);
    approx(&li["averageScore"], 30.0);
    assert_eq!(li["gradedCount"], json!(2));

    let wang = find_by_name(students, "王五");
    approx(&wang["totalScore"], 170.5);
    approx(&wang["averageScore"], 85.25);

    let zhao = find_by_name(students, "赵六");
    approx(&zhao["totalScore"], 0.0);
    approx(&zhao["averageScore"], 0.0);
    assert_eq!(zhao["gradedCount"], json!(0));

    let qian = find_by_name(students, "钱七");
    approx(&qian["totalScore"], 240.0);
    approx(&qian["averageScore"], 80.0);

    // A second pass over unchanged data gives the same numbers.
    request_ok(&mut stdin, &mut reader, "stats.recompute", json!({}));
    let relisted = request_ok(&mut stdin, &mut reader, "students.list", json!({}));
    for (a, b) in students
        .as_array()
        .expect("first")
        .iter()
        .zip(relisted["students"].as_array().expect("second"))
    {
        assert_eq!(a["id"], b["id"]);
        assert_eq!(a["totalScore"], b["totalScore"]);
        assert_eq!(a["averageScore"], b["averageScore"]);
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn edits_stay_stale_until_recompute() {
    let workspace = temp_dir("gradebook-edit");
    let csv_path = write_csv(&workspace, "data.csv", GRADES_CSV);
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "students.importCsv",
        json!({ "path": csv_path.to_string_lossy() }),
    );
    request_ok(&mut stdin, &mut reader, "stats.recompute", json!({}));

    let listed = request_ok(&mut stdin, &mut reader, "students.list", json!({}));
    let zhang_id = find_by_name(&listed["students"], "张三")["id"]
        .as_str()
        .expect("id")
        .to_string();

    request_ok(
        &mut stdin,
        &mut reader,
        "students.update",
        json!({
            "studentId": zhang_id,
            "values": ["2023001", "张三", "", "优秀", "54/65"]
        }),
    );
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "students.get",
        json!({ "studentId": zhang_id }),
    );
    assert_eq!(got["student"]["values"]["语文"], json!(""));
    approx(&got["student"]["totalScore"], 250.0);

    request_ok(&mut stdin, &mut reader, "stats.recompute", json!({}));
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "students.get",
        json!({ "studentId": zhang_id }),
    );
    approx(&got["student"]["totalScore"], 160.0);
    approx(&got["student"]["averageScore"], 80.0);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "students.create",
        json!({ "values": ["2023006", "孙八", "中等", 88] }),
    );
    let new_id = created["studentId"].as_str().expect("studentId").to_string();
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "students.get",
        json!({ "studentId": new_id }),
    );
    assert_eq!(
        got["student"]["fields"],
        json!(["2023006", "孙八", "中等", "88", ""])
    );
    assert!(got["student"]["computedAt"].is_null());

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "students.delete",
        json!({ "studentIds": [new_id, zhang_id, "no-such-id"] }),
    );
    assert_eq!(deleted["deleted"], json!(2));

    let missing = request(
        &mut stdin,
        &mut reader,
        "students.get",
        json!({ "studentId": zhang_id }),
    );
    assert_eq!(missing["error"]["code"], json!("not_found"));

    let missing = request(
        &mut stdin,
        &mut reader,
        "students.update",
        json!({ "studentId": zhang_id, "values": ["x"] }),
    );
    assert_eq!(missing["error"]["code"], json!("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn search_and_sort_follow_identity_columns() {
    let workspace = temp_dir("gradebook-search");
    let csv_path = write_csv(&workspace, "data.csv", GRADES_CSV);
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "students.importCsv",
        json!({ "path": csv_path.to_string_lossy() }),
    );

    let by_name = request_ok(&mut stdin, &mut reader, "students.list", json!({ "query": "李" }));
    assert_eq!(by_name["students"].as_array().map(|a| a.len()), Some(1));

    let by_no = request_ok(&mut stdin, &mut reader, "students.list", json!({ "query": "2023" }));
    assert_eq!(by_no["students"].as_array().map(|a| a.len()), Some(5));

    // "90" only appears in score columns.
    let by_score = request_ok(&mut stdin, &mut reader, "students.list", json!({ "query": "90" }));
    assert_eq!(by_score["students"].as_array().map(|a| a.len()), Some(0));

    request_ok(&mut stdin, &mut reader, "stats.recompute", json!({}));
    let sorted = request_ok(
        &mut stdin,
        &mut reader,
        "students.list",
        json!({ "sortBy": "totalScore", "descending": true }),
    );
    let names: Vec<&str> = sorted["students"]
        .as_array()
        .expect("students")
        .iter()
        .map(|s| s["values"]["姓名"].as_str().expect("name"))
        .collect();
    assert_eq!(names, vec!["张三", "钱七", "王五", "李四", "赵六"]);

    let bad_sort = request(
        &mut stdin,
        &mut reader,
        "students.list",
        json!({ "sortBy": "nope" }),
    );
    assert_eq!(bad_sort["error"]["code"], json!("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn reimport_is_guarded() {
    let workspace = temp_dir("gradebook-reimport");
    let csv_path = write_csv(&workspace, "data.csv", GRADES_CSV);
    let other = write_csv(&workspace, "other.csv", "id,name,score\n1,a,2\n");
    let empty = write_csv(&workspace, "empty.csv", "");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "students.importCsv",
        json!({ "path": empty.to_string_lossy() }),
    );
    assert_eq!(resp["error"]["code"], json!("empty_file"));

    request_ok(
        &mut stdin,
        &mut reader,
        "students.importCsv",
        json!({ "path": csv_path.to_string_lossy() }),
    );

    let again = request_ok(
        &mut stdin,
        &mut reader,
        "students.importCsv",
        json!({ "path": csv_path.to_string_lossy() }),
    );
    assert_eq!(again["skipped"], json!(true));
    assert_eq!(again["imported"], json!(0));

    let appended = request_ok(
        &mut stdin,
        &mut reader,
        "students.importCsv",
        json!({ "path": csv_path.to_string_lossy(), "onlyIfEmpty": false }),
    );
    assert_eq!(appended["imported"], json!(5));
    assert_eq!(appended["schemaCreated"], json!(false));

    let mismatch = request(
        &mut stdin,
        &mut reader,
        "students.importCsv",
        json!({ "path": other.to_string_lossy(), "onlyIfEmpty": false }),
    );
    assert_eq!(mismatch["error"]["code"], json!("schema_mismatch"));
    assert_eq!(mismatch["error"]["details"]["found"], json!(["id", "name", "score"]));

    let listed = request_ok(&mut stdin, &mut reader, "students.list", json!({}));
    assert_eq!(listed["students"].as_array().map(|a| a.len()), Some(10));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn settings_drive_preview_and_recompute() {
    let workspace = temp_dir("gradebook-settings");
    let csv_path = write_csv(
        &workspace,
        "data.csv",
        "id,name,quiz,exam\nS1,Ann,90,fail\nS2,Ben,pass/50,\n",
    );
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let defaults = request_ok(&mut stdin, &mut reader, "settings.get", json!({}));
    assert_eq!(defaults["identityColumns"], json!(2));
    assert!(defaults["scoreColumns"].is_null());
    assert_eq!(defaults["lexicon"][0], json!(["优秀", 95.0]));

    let rejected = request(
        &mut stdin,
        &mut reader,
        "settings.update",
        json!({ "lexicon": "klingon" }),
    );
    assert_eq!(rejected["error"]["code"], json!("bad_params"));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "settings.update",
        json!({ "lexicon": "en" }),
    );
    assert_eq!(updated["lexicon"][0], json!(["excellent", 95.0]));
    assert_eq!(updated["identityColumns"], json!(2));

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "stats.preview",
        json!({ "values": ["S1", "Ann", "90", "", "fail", "0"] }),
    );
    approx(&preview["total"], 90.0);
    approx(&preview["average"], 30.0);
    assert_eq!(preview["gradedCount"], json!(3));
    assert_eq!(preview["scores"].as_array().map(|a| a.len()), Some(4));
    assert_eq!(preview["scores"][1]["graded"], json!(false));

    let normalized = request_ok(
        &mut stdin,
        &mut reader,
        "scores.normalize",
        json!({ "raw": "excellent/40" }),
    );
    approx(&normalized["score"], 95.0);

    let full_width = request_ok(
        &mut stdin,
        &mut reader,
        "scores.normalize",
        json!({ "raw": "８５" }),
    );
    approx(&full_width["score"], 85.0);

    request_ok(
        &mut stdin,
        &mut reader,
        "students.importCsv",
        json!({ "path": csv_path.to_string_lossy() }),
    );

    let repeated = request(
        &mut stdin,
        &mut reader,
        "settings.update",
        json!({ "scoreColumns": [2, 2] }),
    );
    assert_eq!(repeated["ok"], json!(false));
    assert_eq!(repeated["error"]["code"], json!("bad_params"));
    let unchanged = request_ok(&mut stdin, &mut reader, "settings.get", json!({}));
    assert!(unchanged["scoreColumns"].is_null());

    // Only the exam column counts.
    request_ok(
        &mut stdin,
        &mut reader,
        "settings.update",
        json!({ "scoreColumns": [3] }),
    );
    request_ok(&mut stdin, &mut reader, "stats.recompute", json!({}));
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "students.list",
        json!({ "sortBy": "name" }),
    );
    let students = listed["students"].as_array().expect("students");
    approx(&students[0]["totalScore"], 0.0);
    assert_eq!(students[0]["gradedCount"], json!(1));
    assert_eq!(students[1]["gradedCount"], json!(0));

    request_ok(
        &mut stdin,
        &mut reader,
        "settings.update",
        json!({ "scoreColumns": null }),
    );
    request_ok(&mut stdin, &mut reader, "stats.recompute", json!({}));
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "students.list",
        json!({ "sortBy": "name" }),
    );
    let students = listed["students"].as_array().expect("students");
    approx(&students[0]["totalScore"], 90.0);
    approx(&students[0]["averageScore"], 45.0);
    approx(&students[1]["totalScore"], 60.0);
    assert_eq!(students[1]["gradedCount"], json!(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
