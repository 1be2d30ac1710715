//! The corebuild binary: a demo client that computes Ackermann numbers as a
//! rule graph, with rules constructed on demand by the delegate.  Mostly
//! useful for poking at the engine: persistence, tracing, serial mode, and
//! scan stress via `--recompute`.

use crate::db::FileDb;
use crate::engine::{BuildEngine, Delegate, Key, Rule, Task, TaskContext, Value};
use crate::signal;
use anyhow::{anyhow, bail};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Bumping this discards databases written by older corebuild binaries.
const CLIENT_VERSION: u32 = 1;

fn int_from_value(value: &Value) -> i32 {
    assert_eq!(value.len(), 4, "expected a 32-bit value");
    i32::from_le_bytes([value[0], value[1], value[2], value[3]])
}

fn int_to_value(n: i32) -> Value {
    n.to_le_bytes().to_vec()
}

fn ack_key(m: u32, n: u32) -> String {
    format!("ack({},{})", m, n)
}

fn parse_ack_key(key: &Key) -> Option<(u32, u32)> {
    let s = std::str::from_utf8(key.as_bytes()).ok()?;
    let args = s.strip_prefix("ack(")?.strip_suffix(')')?;
    let (m, n) = args.split_once(',')?;
    Some((m.parse().ok()?, n.parse().ok()?))
}

/// Reference implementation for checking the engine's answer.
fn ack(m: u32, n: u32) -> u64 {
    fn inner(memo: &mut Vec<Vec<u64>>, m: u32, n: u32) -> u64 {
        let row = &mut memo[m as usize];
        if (n as usize) >= row.len() {
            row.resize(n as usize + 1, 0);
        }
        if memo[m as usize][n as usize] != 0 {
            return memo[m as usize][n as usize];
        }
        let result = if m == 0 {
            n as u64 + 1
        } else if n == 0 {
            inner(memo, m - 1, 1)
        } else {
            let inner_n = inner(memo, m, n - 1);
            inner(memo, m - 1, inner_n as u32)
        };
        memo[m as usize][n as usize] = result;
        result
    }
    let mut memo = vec![Vec::new(); m as usize + 1];
    inner(&mut memo, m, n)
}

/// Computes one `ack(m,n)` value, requesting the recursive results it
/// depends on as inputs.  The second input's key is only known once the
/// first value arrives.
struct AckTask {
    m: u32,
    n: u32,
    result_a: i32,
    result_b: i32,
}

impl Task for AckTask {
    fn start(&mut self, engine: &mut TaskContext) {
        if self.m == 0 {
            // Base case; no inputs.
        } else if self.n == 0 {
            engine.needs_input(ack_key(self.m - 1, 1), 0);
        } else {
            engine.needs_input(ack_key(self.m, self.n - 1), 0);
        }
    }

    fn provide_value(&mut self, engine: &mut TaskContext, id: usize, value: &Value) {
        if id == 0 {
            self.result_a = int_from_value(value);
            if self.m != 0 && self.n != 0 {
                engine.needs_input(ack_key(self.m - 1, self.result_a as u32), 1);
            }
        } else {
            assert_eq!(id, 1, "invalid input id");
            self.result_b = int_from_value(value);
        }
    }

    fn inputs_available(&mut self, engine: &mut TaskContext) {
        if self.m == 0 {
            // Run the base case on a lane to exercise asynchronous
            // completion.
            let n = self.n;
            engine.spawn(move |ctx| ctx.complete(int_to_value(n as i32 + 1)));
            return;
        }
        let result = if self.n == 0 { self.result_a } else { self.result_b };
        engine.complete(int_to_value(result));
    }
}

struct AckDelegate {
    rules: AtomicUsize,
    tasks_run: Arc<AtomicUsize>,
    verbose: bool,
}

impl Delegate for AckDelegate {
    fn lookup_rule(&self, key: &Key) -> Option<Rule> {
        let (m, n) = parse_ack_key(key)?;
        self.rules.fetch_add(1, Ordering::Relaxed);
        let tasks_run = self.tasks_run.clone();
        let verbose = self.verbose;
        let name = ack_key(m, n);
        Some(Rule::new(key.clone(), move || {
            tasks_run.fetch_add(1, Ordering::Relaxed);
            if verbose {
                println!("{}", name);
            }
            Box::new(AckTask {
                m,
                n,
                result_a: 0,
                result_b: 0,
            })
        }))
    }

    fn error(&self, message: &str) {
        eprintln!("corebuild: {}", message);
    }

    fn is_cancelled(&self) -> bool {
        signal::was_interrupted()
    }
}

#[derive(argh::FromArgs)] // this struct generates the flags and --help output
/// corebuild, an incremental build engine; computes ackermann(M, N) as a
/// demo rule graph
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// result database path [default=ack.db]
    #[argh(option, default = "(\"ack.db\".into())")]
    db: String,

    /// run without a result database
    #[argh(switch)]
    no_db: bool,

    /// run tasks on a single lane
    #[argh(switch)]
    serial: bool,

    /// parallelism [default uses system thread count + 2]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// rebuild the result N extra times to stress dependency scanning
    #[argh(option, default = "0")]
    recompute: usize,

    /// write a json trace of engine events to PATH
    #[argh(option)]
    trace: Option<String>,

    /// dump the rule graph to PATH in graphviz dot format
    #[argh(option)]
    dump_graph: Option<String>,

    /// print each executed rule
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// ackermann argument M
    #[argh(positional)]
    m: u32,

    /// ackermann argument N
    #[argh(positional)]
    n: u32,
}

fn run_impl() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    if opts.m >= 4 {
        bail!("invalid argument M = {} (too large)", opts.m);
    }
    if opts.n >= 1024 {
        bail!("invalid argument N = {} (too large)", opts.n);
    }
    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }
    signal::register_sigint();

    let tasks_run = Arc::new(AtomicUsize::new(0));
    let delegate = Arc::new(AckDelegate {
        rules: AtomicUsize::new(0),
        tasks_run: tasks_run.clone(),
        verbose: opts.verbose,
    });

    let mut engine = if opts.serial {
        BuildEngine::serial(delegate.clone())
    } else if let Some(parallelism) = opts.parallelism {
        BuildEngine::with_lanes(delegate.clone(), parallelism)
    } else {
        BuildEngine::new(delegate.clone())
    };
    if !opts.no_db {
        engine.attach_db(Box::new(FileDb::open(&opts.db, CLIENT_VERSION)?));
    }
    if let Some(path) = &opts.trace {
        engine.enable_tracing(path)?;
    }

    let key = ack_key(opts.m, opts.n);
    let result = int_from_value(&engine.build(key.clone())?);
    println!("ack({}, {}) = {}", opts.m, opts.n, result);
    if opts.n < 10 {
        let expected = ack(opts.m, opts.n);
        if result as u64 != expected {
            bail!("engine computed {} but expected {}", result, expected);
        }
    }
    println!("... computed using {} rules", delegate.rules.load(Ordering::Relaxed));

    for _ in 0..opts.recompute {
        let recomputed = int_from_value(&engine.build(key.clone())?);
        if recomputed != result {
            bail!("recompute produced {} but expected {}", recomputed, result);
        }
    }

    if let Some(path) = &opts.dump_graph {
        engine.dump_graph(path)?;
    }

    let ran = tasks_run.load(Ordering::Relaxed);
    println!(
        "corebuild: ran {} task{}, now up to date",
        ran,
        if ran == 1 { "" } else { "s" }
    );
    Ok(0)
}

pub fn run() -> anyhow::Result<i32> {
    run_impl()
}
