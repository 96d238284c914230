//! Static analysis of the declared computation graph.
//!
//! Nodes are the non-label dataset features (inputs) and the model layers.
//! Analysis checks every reference, orders each output's dependencies, and
//! rejects cycles and nodes that feed no output.

use crate::config::{DataConfig, ModelConfig, NamedMap};
use crate::error::{TrainingError, TrainingResult};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Input,
    Layer,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    pub name: String,
    pub role: NodeRole,
    /// Parent node names. Empty for inputs.
    pub inputs: Vec<String>,
    /// Declaring dataset for inputs, layer type otherwise.
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyGraph {
    nodes: NamedMap<GraphNode>,
    /// Output name to its dependency-ordered node sequence, ending with the output.
    subgraphs: NamedMap<Vec<String>>,
}

impl DependencyGraph {
    pub fn analyze(data: &DataConfig, model: &ModelConfig) -> TrainingResult<Self> {
        let mut nodes: NamedMap<GraphNode> = NamedMap::new();

        for (dataset, config) in data.datasets.iter() {
            for (feature, _) in config.inputs() {
                if !nodes.contains(feature) {
                    nodes.insert(
                        feature,
                        GraphNode {
                            name: feature.to_string(),
                            role: NodeRole::Input,
                            inputs: Vec::new(),
                            source: dataset.to_string(),
                        },
                    );
                }
            }
        }

        for (name, layer) in model.layers.iter() {
            if nodes.contains(name) {
                return Err(TrainingError::config(format!(
                    "node '{name}' is defined both as an input feature and as a layer"
                )));
            }
            let parents = match &layer.in_name {
                None => {
                    return Err(TrainingError::config(format!(
                        "layer '{name}' does not declare in_name"
                    )));
                }
                Some(in_name) => in_name.names(),
            };
            if parents.is_empty() || parents.iter().any(|p| p.trim().is_empty()) {
                return Err(TrainingError::config(format!("layer '{name}' has an empty in_name")));
            }
            let role = if layer.endpoint { NodeRole::Output } else { NodeRole::Layer };
            nodes.insert(
                name,
                GraphNode {
                    name: name.to_string(),
                    role,
                    inputs: parents,
                    source: layer.kind.clone(),
                },
            );
        }

        for node in nodes.values() {
            if let Some(missing) = node.inputs.iter().find(|p| !nodes.contains(p)) {
                return Err(TrainingError::config(format!(
                    "layer '{}' references unknown node '{missing}'",
                    node.name
                )));
            }
        }

        let outputs: Vec<String> =
            nodes.values().filter(|n| n.role == NodeRole::Output).map(|n| n.name.clone()).collect();
        if outputs.is_empty() {
            return Err(TrainingError::config(
                "model declares no output layer (set endpoint: true on at least one layer)",
            ));
        }

        let mut subgraphs = NamedMap::new();
        for output in outputs {
            let mut order = Vec::new();
            let mut done = HashSet::new();
            let mut path = Vec::new();
            visit(&nodes, &output, &mut path, &mut done, &mut order)?;
            subgraphs.insert(output, order);
        }

        let reached: HashSet<&str> =
            subgraphs.values().flat_map(|s| s.iter().map(String::as_str)).collect();
        if let Some(dead) = nodes.names().find(|n| !reached.contains(n)) {
            return Err(TrainingError::config(format!(
                "node '{dead}' does not lead to any output"
            )));
        }

        debug!(nodes = nodes.len(), outputs = subgraphs.len(), "Analyzed dependency graph");
        Ok(Self { nodes, subgraphs })
    }

    /// Output names in declaration order.
    pub fn output_names(&self) -> Vec<String> {
        self.subgraphs.names().map(str::to_string).collect()
    }

    pub fn input_names(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.role == NodeRole::Input)
            .map(|n| n.name.clone())
            .collect()
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn subgraph(&self, output: &str) -> Option<&[String]> {
        self.subgraphs.get(output).map(Vec::as_slice)
    }
}

/// Post-order DFS over parents. `path` holds the current chain for cycle detection.
fn visit(
    nodes: &NamedMap<GraphNode>,
    name: &str,
    path: &mut Vec<String>,
    done: &mut HashSet<String>,
    order: &mut Vec<String>,
) -> TrainingResult<()> {
    if done.contains(name) {
        return Ok(());
    }
    if let Some(start) = path.iter().position(|n| n == name) {
        let mut cycle = path[start..].to_vec();
        cycle.push(name.to_string());
        return Err(TrainingError::config(format!("cycle in model graph: {}", cycle.join(" -> "))));
    }
    let Some(node) = nodes.get(name) else {
        return Err(TrainingError::config(format!("unknown node '{name}'")));
    };

    path.push(name.to_string());
    for parent in &node.inputs {
        visit(nodes, parent, path, done, order)?;
    }
    path.pop();

    done.insert(name.to_string());
    order.push(name.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> DataConfig {
        serde_yaml::from_str(
            r"
datasets:
  toy:
    in:
      x: {shape: [2]}
      z: {shape: [1]}
      y: {shape: [1], label: true}
",
        )
        .unwrap()
    }

    fn model(layers: &str) -> ModelConfig {
        serde_yaml::from_str(&format!("name: m\nlayers:\n{layers}")).unwrap()
    }

    #[test]
    fn test_orders_dependencies_per_output() {
        let m = model(
            "  h: {type: dense, in_name: x}\n  a: {type: dense, in_name: [h, z], endpoint: true}\n  b: {type: dense, in_name: h, endpoint: true}\n",
        );
        let graph = DependencyGraph::analyze(&data(), &m).unwrap();
        assert_eq!(graph.output_names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(graph.subgraph("a").unwrap(), &["x", "h", "z", "a"]);
        assert_eq!(graph.subgraph("b").unwrap(), &["x", "h", "b"]);
        assert_eq!(graph.node("x").unwrap().role, NodeRole::Input);
        assert_eq!(graph.input_names(), vec!["x".to_string(), "z".to_string()]);
    }

    #[test]
    fn test_missing_in_name() {
        let m = model("  a: {type: dense, endpoint: true}\n");
        let err = DependencyGraph::analyze(&data(), &m).unwrap_err();
        assert!(err.to_string().contains("in_name"));
    }

    #[test]
    fn test_unknown_parent() {
        let m = model("  a: {type: dense, in_name: nope, endpoint: true}\n");
        let err = DependencyGraph::analyze(&data(), &m).unwrap_err();
        assert!(err.to_string().contains("unknown node 'nope'"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let m = model(
            "  p: {type: dense, in_name: [x, q]}\n  q: {type: dense, in_name: p}\n  a: {type: dense, in_name: [q, z], endpoint: true}\n",
        );
        let err = DependencyGraph::analyze(&data(), &m).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_dead_end_is_rejected() {
        let m = model("  a: {type: dense, in_name: x, endpoint: true}\n");
        // `z` feeds nothing.
        let err = DependencyGraph::analyze(&data(), &m).unwrap_err();
        assert!(err.to_string().contains("'z'"));
    }

    #[test]
    fn test_requires_an_output() {
        let m = model("  a: {type: dense, in_name: [x, z]}\n");
        assert!(DependencyGraph::analyze(&data(), &m).is_err());
    }

    #[test]
    fn test_layer_shadowing_feature() {
        let m = model("  x: {type: dense, in_name: z, endpoint: true}\n");
        let err = DependencyGraph::analyze(&data(), &m).unwrap_err();
        assert!(err.to_string().contains("both"));
    }
}
