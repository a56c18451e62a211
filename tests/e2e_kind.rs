use std::error::Error;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// Returns true if the given binary is accessible in PATH.
fn tool_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

const CONTROLLER_NAMESPACE: &str = "vpa-graceful-drain-system";
const TEST_NAMESPACE: &str = "vpa-drain-e2e";
const CONFIG_MAP_NAME: &str = "vpa-graceful-drain-config";
const FINALIZER: &str = "vpa-graceful-drain.cho.github.io/finalizer";
const MANAGED_POD: &str = "drain-managed";
const UNMANAGED_POD: &str = "drain-unmanaged";

// ---------------------------------------------------------------------------
// E2E drain test
//
// Runs the controller binary against a real Kind cluster.
// Run with: cargo test --test e2e_kind -- --ignored
// ---------------------------------------------------------------------------

/// End-to-end test of the guard lifecycle:
///
/// 1. Start (or reuse) a Kind cluster.
/// 2. Apply a ConfigMap with a short grace period and drain timeout.
/// 3. Run the controller binary with the local kubeconfig.
/// 4. Create a VPA-managed pod and wait for the finalizer.
/// 5. Delete it and check it is held for the grace period, then released.
/// 6. Check that an unmanaged pod is never guarded.
#[test]
#[ignore]
fn e2e_pod_graceful_drain() -> Result<(), Box<dyn Error>> {
    for tool in &["kind", "kubectl"] {
        if !tool_available(tool) {
            eprintln!("Skipping e2e test: `{tool}` not found in PATH.");
            return Ok(());
        }
    }

    let cluster_name =
        std::env::var("KIND_CLUSTER_NAME").unwrap_or_else(|_| "vpa-drain-e2e".into());
    ensure_kind_cluster(&cluster_name)?;

    for namespace in [CONTROLLER_NAMESPACE, TEST_NAMESPACE] {
        run_cmd(
            "kubectl",
            &[
                "create",
                "namespace",
                namespace,
                "--dry-run=client",
                "-o",
                "yaml",
            ],
        )
        .and_then(|output| kubectl_apply(&output))?;
    }
    kubectl_apply(&config_map_manifest(5, 60))?;

    let _controller = ControllerProcess::spawn()?;
    let _cleanup = Cleanup;

    kubectl_apply(&pod_manifest(MANAGED_POD, true))?;
    kubectl_apply(&pod_manifest(UNMANAGED_POD, false))?;

    wait_for("finalizer attached", Duration::from_secs(60), || {
        Ok(pod_finalizers(MANAGED_POD)?.contains(FINALIZER))
    })?;

    // Give the controller a few reconciles to (not) act on the unmanaged pod
    sleep(Duration::from_secs(5));
    assert!(
        !pod_finalizers(UNMANAGED_POD)?.contains(FINALIZER),
        "unmanaged pod must not be guarded"
    );

    wait_for("pod ready", Duration::from_secs(120), || {
        let ready = run_cmd(
            "kubectl",
            &[
                "get",
                "pod",
                MANAGED_POD,
                "-n",
                TEST_NAMESPACE,
                "-o",
                "jsonpath={.status.conditions[?(@.type==\"Ready\")].status}",
            ],
        )?;
        Ok(ready == "True")
    })?;

    let deleted_at = Instant::now();
    run_cmd(
        "kubectl",
        &[
            "delete",
            "pod",
            MANAGED_POD,
            "-n",
            TEST_NAMESPACE,
            "--wait=false",
        ],
    )?;

    // Still held inside the grace period
    sleep(Duration::from_secs(2));
    let deletion_timestamp = run_cmd(
        "kubectl",
        &[
            "get",
            "pod",
            MANAGED_POD,
            "-n",
            TEST_NAMESPACE,
            "-o",
            "jsonpath={.metadata.deletionTimestamp}",
        ],
    )?;
    assert!(
        !deletion_timestamp.is_empty(),
        "pod should be terminating but still present"
    );

    wait_for("pod released", Duration::from_secs(90), || {
        Ok(run_cmd(
            "kubectl",
            &["get", "pod", MANAGED_POD, "-n", TEST_NAMESPACE],
        )
        .is_err())
    })?;
    assert!(
        deleted_at.elapsed() >= Duration::from_secs(5),
        "pod was released before the grace period ended"
    );

    Ok(())
}

fn config_map_manifest(grace_period: u32, drain_timeout: u32) -> String {
    format!(
        r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: {CONFIG_MAP_NAME}
  namespace: {CONTROLLER_NAMESPACE}
data:
  gracePeriodSeconds: "{grace_period}"
  drainTimeoutSeconds: "{drain_timeout}"
  namespaceSelector: '{{"include": ["{TEST_NAMESPACE}"]}}'
"#
    )
}

fn pod_manifest(name: &str, managed: bool) -> String {
    format!(
        r#"apiVersion: v1
kind: Pod
metadata:
  name: {name}
  namespace: {TEST_NAMESPACE}
  labels:
    app: {name}
  annotations:
    vpa-managed: "{managed}"
spec:
  terminationGracePeriodSeconds: 1
  containers:
    - name: pause
      image: registry.k8s.io/pause:3.9
      ports:
        - containerPort: 8080
"#
    )
}

fn pod_finalizers(name: &str) -> Result<String, Box<dyn Error>> {
    run_cmd(
        "kubectl",
        &[
            "get",
            "pod",
            name,
            "-n",
            TEST_NAMESPACE,
            "-o",
            "jsonpath={.metadata.finalizers}",
        ],
    )
}

/// Controller binary running against the current kubeconfig; killed on drop.
struct ControllerProcess {
    child: Child,
}

impl ControllerProcess {
    fn spawn() -> Result<Self, Box<dyn Error>> {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_vpa-drain-controller"));
        cmd.args(["run", "--health-addr", "127.0.0.1:18081"])
            .env("CONFIG_MAP_NAMESPACE", CONTROLLER_NAMESPACE)
            .env("CONFIG_MAP_NAME", CONFIG_MAP_NAME)
            .env("RUST_LOG", "vpa_graceful_drain=debug")
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
            cmd.env("KUBECONFIG", kubeconfig);
        }
        Ok(Self {
            child: cmd.spawn()?,
        })
    }
}

impl Drop for ControllerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct Cleanup;

impl Drop for Cleanup {
    fn drop(&mut self) {
        // Strip our finalizer in case the controller stopped mid-drain
        for pod in [MANAGED_POD, UNMANAGED_POD] {
            let _ = run_cmd_quiet(
                "kubectl",
                &[
                    "patch",
                    "pod",
                    pod,
                    "-n",
                    TEST_NAMESPACE,
                    "--type=merge",
                    "-p",
                    r#"{"metadata":{"finalizers":null}}"#,
                ],
            );
        }
        let _ = run_cmd_quiet(
            "kubectl",
            &[
                "delete",
                "namespace",
                TEST_NAMESPACE,
                "--ignore-not-found=true",
            ],
        );
    }
}

fn ensure_kind_cluster(name: &str) -> Result<(), Box<dyn Error>> {
    let clusters = run_cmd("kind", &["get", "clusters"])?;
    if clusters.lines().any(|line| line.trim() == name) {
        return Ok(());
    }
    run_cmd("kind", &["create", "cluster", "--name", name])?;
    Ok(())
}

fn kubectl_apply(manifest: &str) -> Result<(), Box<dyn Error>> {
    run_cmd_with_stdin("kubectl", &["apply", "-f", "-"], manifest)?;
    Ok(())
}

fn run_cmd(program: &str, args: &[&str]) -> Result<String, Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let output = cmd.output()?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "command failed: {} {:?}\nstdout:\n{}\nstderr:\n{}",
            program, args, stdout, stderr
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_cmd_with_stdin(program: &str, args: &[&str], input: &str) -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        stdin.write_all(input.as_bytes())?;
        stdin.flush()?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(format!(
            "command failed: {} {:?}\nstderr:\n{}",
            program,
            args,
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(())
}

fn run_cmd_quiet(program: &str, args: &[&str]) -> Result<(), Box<dyn Error>> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
        cmd.env("KUBECONFIG", kubeconfig);
    }
    let _ = cmd.output();
    Ok(())
}

fn wait_for<F>(label: &str, timeout: Duration, mut condition: F) -> Result<(), Box<dyn Error>>
where
    F: FnMut() -> Result<bool, Box<dyn Error>>,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if condition()? {
            return Ok(());
        }
        attempts += 1;
        if start.elapsed() > timeout {
            return Err(format!(
                "timeout while waiting for {} after {:?} (attempts={})",
                label, timeout, attempts
            )
            .into());
        }
        sleep(Duration::from_secs(3));
    }
}
