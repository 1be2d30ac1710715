//! End-to-end tests that run the corebuild binary in a scratch directory.

pub fn corebuild_binary() -> std::path::PathBuf {
    std::env::current_exe()
        .expect("test binary path")
        .parent()
        .expect("test binary directory")
        .parent()
        .expect("binary directory")
        .join("corebuild")
}

pub fn corebuild_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(corebuild_binary());
    cmd.args(args);
    cmd
}

fn print_output(out: &std::process::Output) {
    // Gross: use print! instead of writing to stdout so the Rust test
    // framework can capture it.
    print!("{}", std::str::from_utf8(&out.stdout).unwrap());
    print!("{}", std::str::from_utf8(&out.stderr).unwrap());
}

pub fn assert_output_contains(out: &std::process::Output, text: &str) {
    let stdout = std::str::from_utf8(&out.stdout).unwrap();
    if !stdout.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}",
            text, stdout
        );
    }
}

/// Manages a temporary directory for invoking corebuild.
pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    pub fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    pub fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but print output and fail if the command failed.
    pub fn run_expect(
        &self,
        cmd: &mut std::process::Command,
    ) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("command failed, status {}", out.status);
        }
        Ok(out)
    }
}

#[test]
fn computes_the_right_answer() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run_expect(&mut corebuild_command(vec!["2", "3"]))?;
    assert_output_contains(&out, "ack(2, 3) = 9");
    Ok(())
}

#[test]
fn second_run_does_no_work() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run_expect(&mut corebuild_command(vec!["2", "4"]))?;
    assert_output_contains(&out, "ack(2, 4) = 11");

    let out = space.run_expect(&mut corebuild_command(vec!["2", "4"]))?;
    assert_output_contains(&out, "ack(2, 4) = 11");
    assert_output_contains(&out, "ran 0 tasks");
    Ok(())
}

#[test]
fn no_db_runs_everything_again() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.run_expect(&mut corebuild_command(vec!["--no-db", "2", "3"]))?;
    let out = space.run_expect(&mut corebuild_command(vec!["--no-db", "2", "3"]))?;
    let stdout = String::from_utf8(out.stdout)?;
    assert!(
        !stdout.contains("ran 0 tasks"),
        "expected work on a dbless rerun:\n{}",
        stdout
    );
    Ok(())
}

#[test]
fn serial_mode_matches() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run_expect(&mut corebuild_command(vec!["--serial", "3", "3"]))?;
    assert_output_contains(&out, "ack(3, 3) = 61");
    Ok(())
}

#[test]
fn recompute_stresses_scanning() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run_expect(&mut corebuild_command(vec!["--recompute", "5", "2", "3"]))?;
    assert_output_contains(&out, "ack(2, 3) = 9");
    Ok(())
}

#[test]
fn trace_is_written() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.run_expect(&mut corebuild_command(vec!["--trace", "trace.json", "2", "3"]))?;
    let trace = space.read("trace.json")?;
    let text = String::from_utf8(trace)?;
    assert!(text.starts_with("[\n"), "trace should be a json array");
    assert!(text.trim_end().ends_with(']'), "trace should be closed");
    assert!(text.contains("\"ev\": \"task-completed\""));
    Ok(())
}

#[test]
fn dump_graph_writes_dot() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.run_expect(&mut corebuild_command(vec!["--dump-graph", "graph.dot", "2", "3"]))?;
    let dot = String::from_utf8(space.read("graph.dot")?)?;
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("\"ack(2,3)\" -> \"ack(2,2)\""));
    Ok(())
}

#[test]
fn invalid_arguments_fail() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run(&mut corebuild_command(vec!["9", "3"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "corebuild: error:");
    Ok(())
}
