//! Benchmarks null builds over a deep linear chain, which is pure
//! dependency-scanning work.

use corebuild::engine::{BuildEngine, Delegate, Rule, Task, TaskContext, Value};
use std::sync::Arc;

fn main() {
    divan::main();
}

struct BenchDelegate;
impl Delegate for BenchDelegate {}

struct ChainTask {
    input: Option<String>,
    value: Value,
}

impl Task for ChainTask {
    fn start(&mut self, engine: &mut TaskContext) {
        if let Some(input) = &self.input {
            engine.needs_input(input.as_str(), 0);
        }
    }
    fn provide_value(&mut self, _engine: &mut TaskContext, _id: usize, value: &Value) {
        self.value = value.clone();
    }
    fn inputs_available(&mut self, engine: &mut TaskContext) {
        engine.complete(std::mem::take(&mut self.value));
    }
}

fn chain_engine(depth: usize) -> BuildEngine {
    let mut engine = BuildEngine::serial(Arc::new(BenchDelegate));
    for i in 0..depth {
        let input = if i != depth - 1 {
            Some(format!("input-{}", i + 1))
        } else {
            None
        };
        engine.add_rule(Rule::new(format!("input-{}", i), move || {
            Box::new(ChainTask {
                input: input.clone(),
                value: vec![42],
            }) as Box<dyn Task>
        }));
    }
    engine
}

#[divan::bench(args = [1000, 10000])]
fn null_build(bencher: divan::Bencher, depth: usize) {
    let mut engine = chain_engine(depth);
    engine.build("input-0").unwrap();
    bencher.bench_local(|| engine.build("input-0").unwrap());
}
