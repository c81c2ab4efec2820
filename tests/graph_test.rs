mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{ctx, init_tracing, link, Probe, RenderLog};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use proptest::prelude::*;
use tapegraph::stages::{Constant, FinalStage, Gain};
use tapegraph::{Gid, GraphError, PortKey, Stage, StageGraph, SwapBuffer};

fn log() -> RenderLog {
    RenderLog::default()
}

/// `src -> sink`, initialized.
fn pair(log: &RenderLog) -> (StageGraph, Gid, Gid) {
    let mut src = Probe::new(0, 1, log);
    let mut sink = Probe::sink(1, log);
    link(&mut src, &mut sink);
    let (a, s) = (src.gid(), sink.gid());

    let graph = StageGraph::from_sink(ctx(), vec![src.boxed(), sink.boxed()], s).unwrap();
    graph.initialize().unwrap();
    (graph, a, s)
}

fn edge(graph: &StageGraph, up: Gid, down: Gid) -> bool {
    graph
        .find_stage(up)
        .is_some_and(|s| s.downstream().contains(&down))
}

fn position(order: &[Gid], gid: Gid) -> usize {
    order.iter().position(|g| *g == gid).unwrap()
}

/// A random DAG over `n` stages where stage `n - 1` is the sink and every
/// other stage has at least one downstream edge.
fn dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2usize..10)
        .prop_flat_map(|n| (Just(n), proptest::collection::vec(any::<bool>(), n * (n - 1) / 2)))
        .prop_map(|(n, picks)| {
            let mut edges = Vec::new();
            let mut bits = picks.into_iter();
            for i in 0..n {
                for j in i + 1..n {
                    if bits.next() == Some(true) {
                        edges.push((i, j));
                    }
                }
            }
            for i in 0..n - 1 {
                if !edges.iter().any(|(u, _)| *u == i) {
                    edges.push((i, n - 1));
                }
            }
            (n, edges)
        })
}

proptest! {
    #[test]
    fn render_order_respects_every_path((n, edges) in dag()) {
        let log = log();
        let mut stages: Vec<Probe> = (0..n)
            .map(|i| {
                let indeg = edges.iter().filter(|(_, v)| *v == i).count();
                let outdeg = edges.iter().filter(|(u, _)| *u == i).count();
                if i == n - 1 {
                    Probe::sink(indeg, &log)
                } else {
                    Probe::new(indeg, outdeg, &log)
                }
            })
            .collect();

        for &(u, v) in edges.iter() {
            let (head, tail) = stages.split_at_mut(v);
            prop_assert!(head[u].connect(&mut tail[0]));
        }

        let gids: Vec<Gid> = stages.iter().map(|s| s.gid()).collect();
        let sink = gids[n - 1];
        let boxed: Vec<Box<dyn Stage>> = stages.into_iter().map(Probe::boxed).collect();
        let graph = StageGraph::from_sink(ctx(), boxed, sink).unwrap();
        let order = graph.render_order();
        prop_assert_eq!(order.len(), n);
        prop_assert_eq!(*order.last().unwrap(), sink);

        let mut oracle = DiGraph::<(), ()>::new();
        let nodes: Vec<NodeIndex> = (0..n).map(|_| oracle.add_node(())).collect();
        for &(u, v) in edges.iter() {
            oracle.add_edge(nodes[u], nodes[v], ());
        }
        for a in 0..n {
            for b in 0..n {
                if a != b && has_path_connecting(&oracle, nodes[a], nodes[b], None) {
                    prop_assert!(position(&order, gids[a]) < position(&order, gids[b]));
                }
            }
        }

        for (i, gid) in gids.iter().enumerate() {
            let is_input = !edges.iter().any(|(_, v)| *v == i);
            prop_assert_eq!(graph.inputs().contains(gid), is_input);
        }

        graph.initialize().unwrap();
        graph.render(0);
        prop_assert_eq!(&*log.lock(), &order);
    }
}

#[test]
fn construction_rejects_cycles() {
    init_tracing();
    let log = log();
    let mut a = Probe::new(1, 1, &log);
    let mut b = Probe::new(1, 2, &log);
    let mut s = Probe::sink(1, &log);
    link(&mut a, &mut b);
    link(&mut b, &mut a);
    link(&mut b, &mut s);
    let sink = s.gid();

    let result = StageGraph::from_sink(ctx(), vec![a.boxed(), b.boxed(), s.boxed()], sink);
    assert!(matches!(result, Err(GraphError::Cycle(_))));
}

#[test]
fn construction_needs_exactly_one_sink() {
    let log = log();
    let mut a = Probe::new(0, 2, &log);
    let mut s1 = Probe::sink(1, &log);
    let mut s2 = Probe::sink(1, &log);
    link(&mut a, &mut s1);
    link(&mut a, &mut s2);
    let (ga, g1) = (a.gid(), s1.gid());

    let lonely = Probe::new(0, 0, &log);
    let result = StageGraph::from_sources(ctx(), vec![lonely.boxed()], &[]);
    assert!(matches!(result, Err(GraphError::NoSink)));

    let none: Vec<Box<dyn Stage>> = Vec::new();
    assert!(matches!(
        StageGraph::from_sink(ctx(), none, g1),
        Err(GraphError::EmptyGraph)
    ));

    let result = StageGraph::from_sources(ctx(), vec![a.boxed(), s1.boxed(), s2.boxed()], &[ga]);
    assert!(matches!(result, Err(GraphError::MultipleSinks(_, _))));
}

#[test]
fn construction_rejects_dead_ends_and_strays() {
    let log = log();
    let mut a = Probe::new(0, 1, &log);
    let mut b = Probe::new(1, 1, &log);
    link(&mut a, &mut b);
    let gb = b.gid();
    let result = StageGraph::from_sink(ctx(), vec![a.boxed(), b.boxed()], gb);
    assert!(matches!(result, Err(GraphError::NotASink(g)) if g == gb));

    let mut a = Probe::new(0, 1, &log);
    let mut s = Probe::sink(1, &log);
    link(&mut a, &mut s);
    let stray = Probe::new(0, 1, &log);
    let (gs, gstray) = (s.gid(), stray.gid());
    let result = StageGraph::from_sink(ctx(), vec![a.boxed(), s.boxed(), stray.boxed()], gs);
    assert!(matches!(result, Err(GraphError::Unreachable(g)) if g == gstray));
}

#[test]
fn render_before_initialize_does_nothing() {
    let log = log();
    let mut src = Probe::new(0, 1, &log);
    let mut sink = Probe::sink(1, &log);
    link(&mut src, &mut sink);
    let s = sink.gid();

    let graph = StageGraph::from_sink(ctx(), vec![src.boxed(), sink.boxed()], s).unwrap();
    graph.render(0);
    assert!(log.lock().is_empty());
    assert!(!graph.is_initialized());

    graph.initialize().unwrap();
    graph.render(0);
    assert_eq!(log.lock().len(), 2);
}

#[test]
fn initialize_reports_failing_stage() {
    let log = log();
    let mut src = Probe::new(0, 1, &log).failing_bind();
    let mut sink = Probe::sink(1, &log);
    link(&mut src, &mut sink);
    let (a, s) = (src.gid(), sink.gid());

    let graph = StageGraph::from_sink(ctx(), vec![src.boxed(), sink.boxed()], s).unwrap();
    assert_eq!(graph.initialize(), Err(GraphError::BindFailed(a)));
    assert!(!graph.is_initialized());
}

#[test]
fn insert_then_remove_restores_the_edge() {
    init_tracing();
    let log = log();
    let (graph, a, s) = pair(&log);
    let before = graph.render_order();

    let mid = Probe::new(1, 1, &log);
    let m = mid.gid();
    assert!(graph.insert_between(a, s, mid.boxed()).is_ok());
    assert_eq!(graph.render_order(), vec![a, m, s]);
    assert!(edge(&graph, a, m) && edge(&graph, m, s));
    assert!(!edge(&graph, a, s));
    assert!(graph.find_stage(m).unwrap().is_initialized());

    let removed = graph.remove(m).unwrap();
    assert!(removed.upstream().is_empty() && removed.downstream().is_empty());
    assert_eq!(graph.render_order(), before);
    assert!(edge(&graph, a, s));
    assert_eq!(graph.inputs(), vec![a]);
    assert_eq!(graph.outputs(), vec![s]);

    graph.render(0);
    assert_eq!(*log.lock(), vec![a, s]);
}

#[test]
fn insert_before_and_after_use_the_sole_neighbour() {
    let log = log();
    let (graph, a, s) = pair(&log);

    let before = Probe::new(1, 1, &log);
    let after = Probe::new(1, 1, &log);
    let (gb, ga) = (before.gid(), after.gid());
    assert!(graph.insert_before(s, before.boxed()).is_ok());
    assert!(graph.insert_after(a, after.boxed()).is_ok());
    assert_eq!(graph.render_order(), vec![a, ga, gb, s]);

    // a source has no upstream stage to insert before
    let rejected = graph.insert_before(a, Probe::new(1, 1, &log).boxed());
    assert!(rejected.is_err());
    assert_eq!(graph.len(), 4);
}

#[test]
fn rejected_insert_hands_the_stage_back() {
    let log = log();
    let (graph, a, s) = pair(&log);
    let order = graph.render_order();

    // no such edge
    let stage = Probe::new(1, 1, &log);
    let g = stage.gid();
    let back = graph.insert_between(s, a, stage.boxed()).err().unwrap();
    assert_eq!(back.gid(), g);

    // already wired to something else
    let mut wired = Probe::new(1, 1, &log);
    let mut other = Probe::sink(1, &log);
    link(&mut wired, &mut other);
    let back = graph.insert_between(a, s, wired.boxed()).err().unwrap();
    assert_eq!(back.downstream().len(), 1);

    // no free output to reach the sink with
    let back = graph.insert_between(a, s, Probe::new(1, 0, &log).boxed());
    assert!(back.is_err());

    assert_eq!(graph.render_order(), order);
    assert!(edge(&graph, a, s));
    assert_eq!(graph.len(), 2);
}

#[test]
fn failed_live_insert_rolls_back() {
    let log = log();
    let (graph, a, s) = pair(&log);

    let back = graph
        .insert_between(a, s, Probe::new(1, 1, &log).failing_init().boxed())
        .err()
        .unwrap();
    assert!(back.upstream().is_empty() && back.downstream().is_empty());
    assert!(edge(&graph, a, s));
    assert_eq!(graph.render_order(), vec![a, s]);

    assert!(graph
        .insert_between(a, s, Probe::new(1, 1, &log).failing_bind().boxed())
        .is_err());
    assert!(edge(&graph, a, s));
    assert!(graph.is_initialized());

    graph.render(7);
    assert_eq!(*log.lock(), vec![a, s]);
    assert_eq!(graph.read_port(PortKey::new(a, 0)).unwrap(), vec![1.0; 8]);
}

#[test]
fn remove_refuses_the_sink_and_junctions() {
    let log = log();
    let mut a = Probe::new(0, 1, &log);
    let mut b = Probe::new(0, 1, &log);
    let mut mix = Probe::new(2, 1, &log);
    let mut s = Probe::sink(1, &log);
    link(&mut a, &mut mix);
    link(&mut b, &mut mix);
    link(&mut mix, &mut s);
    let (gm, gs) = (mix.gid(), s.gid());

    let graph = StageGraph::from_sink(
        ctx(),
        vec![a.boxed(), b.boxed(), mix.boxed(), s.boxed()],
        gs,
    )
    .unwrap();
    graph.initialize().unwrap();

    assert!(graph.remove(gs).is_none());
    assert!(graph.remove(gm).is_none());
    assert!(graph.remove(Gid::next()).is_none());
    assert_eq!(graph.len(), 4);
}

#[test]
fn removing_a_source_leaves_its_consumer_unlinked() {
    let log = log();
    let (graph, a, s) = pair(&log);

    assert!(graph.remove(a).is_some());
    assert_eq!(graph.render_order(), vec![s]);
    assert_eq!(graph.inputs(), vec![s]);
    graph.render(0);
    assert_eq!(*log.lock(), vec![s]);
}

#[test]
fn replace_moves_every_edge() {
    let log = log();
    let mut a = Probe::new(0, 1, &log);
    let mut mid = Probe::new(1, 1, &log);
    let mut s = Probe::sink(1, &log);
    link(&mut a, &mut mid);
    link(&mut mid, &mut s);
    let (ga, gm, gs) = (a.gid(), mid.gid(), s.gid());

    let graph = StageGraph::from_sink(ctx(), vec![a.boxed(), mid.boxed(), s.boxed()], gs).unwrap();
    graph.initialize().unwrap();

    let fresh = Probe::new(1, 1, &log);
    let gf = fresh.gid();
    let old = graph.replace(gm, fresh.boxed()).ok().unwrap();
    assert_eq!(old.gid(), gm);
    assert!(old.upstream().is_empty() && old.downstream().is_empty());
    assert!(!graph.contains(gm));
    assert!(edge(&graph, ga, gf) && edge(&graph, gf, gs));
    assert_eq!(graph.render_order(), vec![ga, gf, gs]);

    // a stage without an input cannot take over the edges
    let back = graph.replace(gf, Probe::new(0, 1, &log).boxed());
    assert!(back.is_err());
    assert_eq!(graph.render_order(), vec![ga, gf, gs]);
}

/// Gids of the stages feeding the first `n` ports of `gid`.
fn feeds(graph: &StageGraph, gid: Gid, n: usize) -> Vec<Option<Gid>> {
    let stage = graph.find_stage(gid).unwrap();
    stage.ports()[..n].iter().map(|p| p.link().map(|k| k.gid)).collect()
}

#[test]
fn replace_keeps_each_edge_on_its_port() {
    let log = log();
    let mut a = Probe::new(0, 1, &log);
    let mut b = Probe::new(0, 1, &log);
    let mut mix = Probe::new(2, 1, &log);
    let mut s = Probe::sink(1, &log);
    // b takes in0 and a takes in1, the reverse of their gid order
    link(&mut b, &mut mix);
    link(&mut a, &mut mix);
    link(&mut mix, &mut s);
    let (ga, gb, gm, gs) = (a.gid(), b.gid(), mix.gid(), s.gid());
    assert!(ga < gb);

    let stages = vec![a.boxed(), b.boxed(), mix.boxed(), s.boxed()];
    let graph = StageGraph::from_sink(ctx(), stages, gs).unwrap();
    graph.initialize().unwrap();

    // a failed replacement restores the old wiring exactly
    let broken = Probe::new(2, 1, &log).failing_init();
    assert!(graph.replace(gm, broken.boxed()).is_err());
    assert_eq!(feeds(&graph, gm, 2), vec![Some(gb), Some(ga)]);

    let fresh = Probe::new(2, 1, &log);
    let gf = fresh.gid();
    assert!(graph.replace(gm, fresh.boxed()).is_ok());
    assert_eq!(feeds(&graph, gf, 2), vec![Some(gb), Some(ga)]);
    assert!(edge(&graph, gf, gs));
}

#[test]
fn replace_can_swap_the_sink() {
    let log = log();
    let (graph, a, s) = pair(&log);

    assert!(graph.replace(s, Probe::new(1, 1, &log).boxed()).is_err());

    let sink = Probe::sink(1, &log);
    let g = sink.gid();
    assert!(graph.replace(s, sink.boxed()).is_ok());
    assert_eq!(graph.sink(), g);
    assert_eq!(graph.outputs(), vec![g]);
    assert_eq!(graph.render_order(), vec![a, g]);
}

#[test]
fn data_flows_along_port_links() {
    let log = log();
    let mut a = Probe::new(0, 2, &log);
    let mut b = Probe::new(1, 1, &log);
    let mut mix = Probe::new(2, 1, &log);
    let mut s = Probe::sink(1, &log);
    link(&mut a, &mut b);
    link(&mut a, &mut mix);
    link(&mut b, &mut mix);
    link(&mut mix, &mut s);
    let (gb, gm, gs) = (b.gid(), mix.gid(), s.gid());

    let graph = StageGraph::from_sink(
        ctx(),
        vec![a.boxed(), b.boxed(), mix.boxed(), s.boxed()],
        gs,
    )
    .unwrap();
    graph.initialize().unwrap();
    graph.render(0);

    // a = 1, b = 1 + a, mix = 1 + a + b
    assert_eq!(graph.read_port(PortKey::new(gb, 1)).unwrap(), vec![2.0; 8]);
    assert_eq!(graph.read_port(PortKey::new(gm, 2)).unwrap(), vec![4.0; 8]);
    // the sink's input resolves to the mixer's output
    assert_eq!(graph.read_port(PortKey::new(gs, 0)).unwrap(), vec![4.0; 8]);
}

#[test]
fn host_writes_init_only_ports() {
    let ctx = ctx();
    let swap = Arc::new(SwapBuffer::new(ctx.block_len()));
    let mut source = Constant::new(2.0);
    let mut gain = Gain::new(0.5);
    let mut out = FinalStage::new(swap.clone());
    link(&mut source, &mut gain);
    link(&mut gain, &mut out);
    let (gc, gg, gs) = (source.gid(), gain.gid(), out.gid());

    let stages: Vec<Box<dyn Stage>> = vec![Box::new(source), Box::new(gain), Box::new(out)];
    let graph = StageGraph::from_sink(ctx, stages, gs).unwrap();
    graph.initialize().unwrap();

    assert!(graph.write_port(PortKey::new(gg, 2), &[0.25]));
    // outputs and linked inputs belong to the graph
    assert!(!graph.write_port(PortKey::new(gc, 0), &[1.0]));
    assert!(!graph.write_port(PortKey::new(gg, 0), &[1.0]));
    assert!(!graph.write_port(PortKey::new(gg, 9), &[1.0]));

    graph.render(0);
    assert_eq!(**swap.read_buffer(), [1.25; 8]);
    assert_eq!(graph.read_port(PortKey::new(gg, 2)).unwrap(), vec![0.25]);
}

#[test]
fn edits_while_rendering_on_another_thread() {
    let log = log();
    let (graph, a, s) = pair(&log);
    let graph = Arc::new(graph);
    let done = Arc::new(AtomicBool::new(false));

    let renderer = {
        let graph = graph.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            let mut time = 0;
            while !done.load(Ordering::Acquire) {
                graph.render(time);
                time += 1;
            }
            time
        })
    };

    for _ in 0..200 {
        let stage = Probe::new(1, 1, &log);
        let g = stage.gid();
        assert!(graph.insert_between(a, s, stage.boxed()).is_ok());
        assert_eq!(graph.render_order().len(), 3);
        assert!(graph.remove(g).is_some());
    }

    done.store(true, Ordering::Release);
    renderer.join().unwrap();
    assert_eq!(graph.render_order(), vec![a, s]);
}
