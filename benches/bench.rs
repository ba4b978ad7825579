use criterion::{criterion_group, criterion_main, Criterion};
use ebb::graph::{Action, FileId, Graph, Relation};
use ebb::work::{Options, Work};

/// A linear chain of n actions: src -> gen0 -> gen1 -> ... -> gen(n-1).
fn chain_graph(n: usize) -> (Graph, FileId) {
    let mut graph = Graph::new();
    let mut prev = graph.file_id("src");
    for i in 0..n {
        let out = graph.file_id(&format!("gen{}", i));
        let mut action = Action::new(out);
        action.add_input(prev, Relation::Input);
        action.cmdline = Some("true".to_owned());
        graph.add_action(action).unwrap();
        prev = out;
    }
    (graph, prev)
}

pub fn bench_construct(c: &mut Criterion) {
    c.bench_function("construct chain of 1000", |b| {
        b.iter(|| chain_graph(1000))
    });
}

pub fn bench_check(c: &mut Criterion) {
    c.bench_function("check chain of 1000", |b| {
        b.iter(|| {
            let (graph, target) = chain_graph(1000);
            let mut work = Work::new(
                &graph,
                Options {
                    parallelism: 1,
                    verbose: false,
                    dry_run: false,
                },
            );
            work.want_file(target);
        })
    });
}

criterion_group!(benches, bench_construct, bench_check);
criterion_main!(benches);
