//! End-to-end tests over a real listener.
//!
//! The native variant runs against a shell-script "compiler" that writes a
//! shell-script "binary", so no C compiler is needed. The in-process
//! variant runs against a tiny WAT toolchain double.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use csandbox_common::SandboxConfig;
use csandbox_server::{SandboxServer, TestHandle};

const FAKE_CC: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo fake-cc 1.0; exit 0; fi
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
printf '#!/bin/sh\necho compiled\nexit 3\n' > "$out"
chmod 755 "$out"
"#;

const TOOLCHAIN_WAT: &str = r#"
(module
  (import "env" "cc_putchar" (func $putchar (param i32 i32)))
  (import "env" "cc_error" (func $error (param i32 i32)))
  (import "env" "cc_getchar" (func $getchar (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "empty source")
  (global $heap (mut i32) (i32.const 1024))

  (func (export "malloc") (param $n i32) (result i32)
    (local $p i32)
    (local.set $p (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (i32.add (local.get $n) (i32.const 8))))
    (local.get $p))
  (func (export "free") (param i32))
  (func (export "cc_new") (result i32) (i32.const 1))
  (func (export "cc_delete") (param i32))
  (func (export "cc_add_option") (param i32 i32) (result i32) (i32.const 0))
  (func (export "cc_compile_string") (param $s i32) (param $src i32) (result i32)
    (if (i32.eqz (i32.load8_u (local.get $src)))
      (then
        (call $error (i32.const 16) (i32.const 12))
        (return (i32.const -1))))
    (i32.const 0))
  (func (export "cc_relocate") (param i32) (result i32) (i32.const 1))
  (func (export "cc_get_symbol") (param i32 i32) (result i32) (i32.const 1))
  (func (export "cc_call") (param i32 i32) (result i32)
    (call $putchar (i32.const 1) (i32.const 72))
    (call $putchar (i32.const 1) (i32.const 105))
    (call $putchar (i32.const 1) (i32.const 10))
    (i32.const 7))
)
"#;

fn config_in(dir: &Path) -> SandboxConfig {
    let fake_cc = dir.join("fake-cc");
    std::fs::write(&fake_cc, FAKE_CC).unwrap();
    std::fs::set_permissions(&fake_cc, std::fs::Permissions::from_mode(0o755)).unwrap();

    let image = dir.join("cc.wat");
    std::fs::write(&image, TOOLCHAIN_WAT).unwrap();

    let mut config = SandboxConfig::default();
    config.engine.pooling_allocator = false;
    config.execution.cleanup_delay_ms = 0;
    config.toolchain.compiler = fake_cc.to_string_lossy().into_owned();
    config.toolchain.compiler_args = Vec::new();
    config.toolchain.wasm_image = image.to_string_lossy().into_owned();
    config.toolchain.temp_dir = Some(dir.join("work"));
    config
}

async fn start(dir: &Path) -> TestHandle {
    SandboxServer::start_test(config_in(dir)).await.unwrap()
}

async fn post(server: &TestHandle, path: &str, body: &str) -> (u16, serde_json::Value) {
    let response = reqwest::Client::new()
        .post(format!("{}{path}", server.url()))
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap();

    let status = response.status().as_u16();
    let text = response.text().await.unwrap();
    (status, serde_json::from_str(&text).unwrap())
}

#[tokio::test]
async fn test_run_native() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path()).await;

    let (status, body) = post(&server, "/run", r#"{"code": "int main(void){return 3;}"}"#).await;

    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["stdout"], "compiled\n");
    assert_eq!(body["exit_code"], 3);
    assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_run_wasm() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path()).await;

    let (status, body) = post(
        &server,
        "/run/wasm",
        r#"{"code": "int main(void){puts(\"Hi\");return 7;}", "entry": "main"}"#,
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["stdout"], "Hi\n");
    assert_eq!(body["exit_code"], 7);

    server.shutdown().await;
}

#[tokio::test]
async fn test_wasm_compile_failure_carries_diagnostic() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path()).await;

    let (status, body) = post(&server, "/run/wasm", r#"{"code": ""}"#).await;

    assert_eq!(status, 200);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "compile_failed");
    assert!(body["stderr"].as_str().unwrap().contains("empty source"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_ready_after_first_load() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(dir.path()).await;
    let client = reqwest::Client::new();

    let before = client
        .get(format!("{}/ready", server.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(before.status().as_u16(), 503);

    server.state().warm_up().await;

    let after = client
        .get(format!("{}/ready", server.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(after.status().as_u16(), 200);
    assert!(server.state().native_ready());
    assert!(server.state().wasm_ready());

    server.shutdown().await;
}
