//! Compiling equal graphs always yields equal programs.

use std::time::Duration;

use proptest::prelude::*;
use weft_compiler::compile;
use weft_ir::{Condition, Edge, Node, ProcessBuilder, ProcessGraph, RaceTrigger};

fn order_process() -> ProcessGraph {
    ProcessBuilder::new()
        .start("start")
        .service_task_with_retries("charge", "payments.charge", 2)
        .exclusive("approved")
        .parallel_split("fulfil")
        .service_task("pack", "warehouse.pack")
        .service_task("invoice", "billing.invoice")
        .parallel_join("fulfilled")
        .race(
            "await_pickup",
            vec![
                (RaceTrigger::Timer { duration_ms: 5_000 }, "expire"),
                (
                    RaceTrigger::Message {
                        name: "picked_up".into(),
                        correlation_key: Some("order_id".into()),
                    },
                    "done",
                ),
            ],
        )
        .boundary_timer("charge_timeout", "charge", Duration::from_secs(60), true)
        .end("done")
        .end("expire")
        .terminate("rejected")
        .end("timed_out")
        .flow("start", "charge")
        .flow("charge", "approved")
        .error_flow("charge", "rejected", "CARD_DECLINED")
        .flow_when("approved", "fulfil", Condition::flag("ok"))
        .default_flow("approved", "rejected")
        .flow("fulfil", "pack")
        .flow("fulfil", "invoice")
        .flow("pack", "fulfilled")
        .flow("invoice", "fulfilled")
        .flow("fulfilled", "await_pickup")
        .flow("charge_timeout", "timed_out")
        .build()
        .unwrap()
}

fn parts(graph: &ProcessGraph) -> (Vec<Node>, Vec<Edge>) {
    // Race arms are re-derived from the node, so skip their implicit flows.
    let nodes: Vec<Node> = graph.nodes().into_iter().cloned().collect();
    let edges = graph
        .edges()
        .into_iter()
        .filter(|e| e.from.as_str() != "await_pickup")
        .cloned()
        .collect();
    (nodes, edges)
}

#[test]
fn repeated_compilation_is_byte_identical() {
    let graph = order_process();
    let first = compile(&graph).unwrap();
    let second = compile(&graph).unwrap();
    assert_eq!(first.hash(), second.hash());
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
}

#[test]
fn different_processes_hash_differently() {
    let a = compile(&order_process()).unwrap();
    let b = ProcessBuilder::new()
        .start("start")
        .end("end")
        .flow("start", "end")
        .build()
        .unwrap();
    assert_ne!(a.hash(), compile(&b).unwrap().hash());
}

#[test]
fn disassembly_names_every_node() {
    let program = compile(&order_process()).unwrap();
    let listing = program.disassemble();
    for node in order_process().nodes() {
        assert!(listing.contains(&format!("{}:", node.id)), "missing {}", node.id);
    }
}

proptest! {
    #[test]
    fn insertion_order_does_not_change_the_hash(
        node_seed in any::<u64>(),
        edge_seed in any::<u64>(),
        reverse in any::<bool>(),
    ) {
        let baseline = compile(&order_process()).unwrap();
        let (mut nodes, mut edges) = parts(&order_process());

        let n = nodes.len();
        nodes.rotate_left((node_seed as usize) % n);
        let m = edges.len();
        edges.rotate_left((edge_seed as usize) % m);
        if reverse {
            nodes.reverse();
            edges.reverse();
        }

        let shuffled = compile(&ProcessGraph::from_parts(nodes, edges).unwrap()).unwrap();
        prop_assert_eq!(baseline.hash(), shuffled.hash());
    }
}
