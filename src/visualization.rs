//! Pipeline graph rendering as Mermaid diagram source.
//!
//! `VisualAst` is a structural snapshot of a pipe (nodes, edges, hook
//! counts); `MermaidRenderer` turns it into `graph TD` source with per-kind
//! node shapes and classes. Step kinds map to shapes: plain steps are
//! rectangles, streaming steps stadiums, maps subroutines, switches
//! rhombuses, subs trapezoids; map targets are re-declared with the `procs`
//! shape and map edges drawn dotted.

use indexmap::IndexMap;

use crate::pipe::StepSettings;
use crate::types::StepKind;

/// One node of the rendered graph.
#[derive(Debug, Clone)]
pub struct VisualNode {
    /// Mermaid node id (`n0`, `n1`, ...).
    pub id: String,
    /// Step name.
    pub name: String,
    pub kind: StepKind,
    /// Whether some map fans out into this node.
    pub is_map_target: bool,
    /// Whether nothing connects to or from this node.
    pub is_isolated: bool,
}

/// One edge of the rendered graph.
#[derive(Debug, Clone)]
pub struct VisualEdge {
    pub source: String,
    pub target: String,
    /// Optional edge label (switch route keys).
    pub label: Option<String>,
    /// Whether this is a fan-out edge.
    pub is_map_edge: bool,
}

/// Structural snapshot of a pipeline.
#[derive(Debug, Clone, Default)]
pub struct VisualAst {
    /// Nodes keyed by step name, in registration order.
    pub nodes: IndexMap<String, VisualNode>,
    pub edges: Vec<VisualEdge>,
    pub startup_hooks: usize,
    pub shutdown_hooks: usize,
}

impl VisualAst {
    /// Build the AST from a pipe's registries.
    pub(crate) fn build<S, C>(
        settings: &IndexMap<String, StepSettings<S, C>>,
        topology: &IndexMap<String, Vec<String>>,
        startup_hooks: usize,
        shutdown_hooks: usize,
    ) -> Self {
        let mut nodes: IndexMap<String, VisualNode> = settings
            .iter()
            .enumerate()
            .map(|(i, (name, cfg))| {
                (
                    name.clone(),
                    VisualNode {
                        id: format!("n{i}"),
                        name: name.clone(),
                        kind: cfg.kind,
                        is_map_target: false,
                        is_isolated: false,
                    },
                )
            })
            .collect();

        let mut edges = Vec::new();
        for (source, successors) in topology {
            for target in successors {
                edges.push(VisualEdge {
                    source: source.clone(),
                    target: target.clone(),
                    label: None,
                    is_map_edge: false,
                });
            }
        }
        for (name, cfg) in settings {
            if let Some(target) = &cfg.map_target {
                if let Some(node) = nodes.get_mut(target) {
                    node.is_map_target = true;
                }
                edges.push(VisualEdge {
                    source: name.clone(),
                    target: target.clone(),
                    label: None,
                    is_map_edge: true,
                });
            }
            if let Some(routes) = &cfg.switch_routes {
                for target in routes.static_targets() {
                    edges.push(VisualEdge {
                        source: name.clone(),
                        target,
                        label: None,
                        is_map_edge: false,
                    });
                }
            }
            if let Some(default) = &cfg.switch_default {
                edges.push(VisualEdge {
                    source: name.clone(),
                    target: default.clone(),
                    label: Some("default".to_string()),
                    is_map_edge: false,
                });
            }
        }

        let connected: Vec<&str> = edges
            .iter()
            .flat_map(|e| [e.source.as_str(), e.target.as_str()])
            .collect();
        for (name, node) in nodes.iter_mut() {
            node.is_isolated = !connected.contains(&name.as_str());
        }

        Self {
            nodes,
            edges,
            startup_hooks,
            shutdown_hooks,
        }
    }
}

/// Mermaid styling and layout configuration.
#[derive(Debug, Clone)]
pub struct MermaidTheme {
    /// Graph direction (`TD`, `LR`, ...).
    pub direction: String,
    pub step_fill: String,
    pub streaming_fill: String,
    pub map_fill: String,
    pub switch_fill: String,
    pub sub_fill: String,
}

impl Default for MermaidTheme {
    fn default() -> Self {
        Self {
            direction: "TD".to_string(),
            step_fill: "#e8f4fd".to_string(),
            streaming_fill: "#fdf3e0".to_string(),
            map_fill: "#e9f7ef".to_string(),
            switch_fill: "#fdeaea".to_string(),
            sub_fill: "#f0eafd".to_string(),
        }
    }
}

impl MermaidTheme {
    /// A theme with a custom direction.
    pub fn with_direction(direction: impl Into<String>) -> Self {
        Self {
            direction: direction.into(),
            ..Default::default()
        }
    }

    /// The `graph <direction>` header line.
    pub fn render_header(&self) -> String {
        format!("graph {}", self.direction)
    }

    /// The `classDef` style lines.
    pub fn render_styles(&self) -> Vec<String> {
        vec![
            format!("classDef step fill:{},stroke:#5b9bd5;", self.step_fill),
            format!(
                "classDef streaming fill:{},stroke:#e3a008;",
                self.streaming_fill
            ),
            format!("classDef map fill:{},stroke:#27ae60;", self.map_fill),
            format!("classDef switch fill:{},stroke:#d64545;", self.switch_fill),
            format!("classDef sub fill:{},stroke:#8e6bd8;", self.sub_fill),
            "classDef isolated stroke-dasharray: 5 5,opacity:0.6;".to_string(),
        ]
    }
}

/// Renders a [`VisualAst`] as Mermaid source.
pub struct MermaidRenderer {
    ast: VisualAst,
    theme: MermaidTheme,
    /// Accumulated output lines.
    pub lines: Vec<String>,
}

impl MermaidRenderer {
    pub fn new(ast: VisualAst) -> Self {
        Self::with_theme(ast, MermaidTheme::default())
    }

    pub fn with_theme(ast: VisualAst, theme: MermaidTheme) -> Self {
        Self {
            ast,
            theme,
            lines: Vec::new(),
        }
    }

    /// Produce the full diagram source.
    pub fn render(&mut self) -> String {
        self.lines.clear();
        let header = self.theme.render_header();
        self.add(&header, 0);

        if self.ast.nodes.is_empty() {
            self.add("Empty[No steps registered]", 1);
            return self.lines.join("\n");
        }

        let nodes: Vec<VisualNode> = self.ast.nodes.values().cloned().collect();
        for node in &nodes {
            let line = self.render_node(node, node.is_isolated);
            self.add(&line, 1);
        }
        for node in &nodes {
            self.add(&format!("class {} {};", node.id, node.kind), 1);
        }

        let edges = self.ast.edges.clone();
        for edge in &edges {
            let line = self.render_edge(edge);
            self.add(&line, 1);
        }

        // Map targets get the process-stack shape.
        for node in &nodes {
            if node.is_map_target {
                let label = self.format_label(&node.name);
                self.add(
                    &format!("{}@{{ shape: procs, label: \"{}\" }}", node.id, label),
                    1,
                );
            }
        }

        for style in self.theme.render_styles() {
            self.add(&style, 1);
        }
        self.lines.join("\n")
    }

    /// Render one node declaration.
    pub fn render_node(&self, node: &VisualNode, is_isolated: bool) -> String {
        let label = self.format_label(&node.name);
        let shape = match node.kind {
            StepKind::Step => format!("{}[\"{}\"]", node.id, label),
            StepKind::Streaming => format!("{}([\"{} ⚡\"])", node.id, label),
            StepKind::Map => format!("{}[[\"{}\"]]", node.id, label),
            StepKind::Switch => format!("{}{{\"{}\"}}", node.id, label),
            StepKind::Sub => format!("{}[/\"{}\" /]", node.id, label),
        };
        if is_isolated {
            format!("{shape}:::isolated")
        } else {
            shape
        }
    }

    fn render_edge(&self, edge: &VisualEdge) -> String {
        let source = self.node_id(&edge.source);
        let target = self.node_id(&edge.target);
        if edge.is_map_edge {
            format!("{source} -. map .-> {target}")
        } else if let Some(label) = &edge.label {
            format!("{source} -- \"{label}\" --> {target}")
        } else {
            format!("{source} --> {target}")
        }
    }

    fn node_id(&self, name: &str) -> String {
        self.ast
            .nodes
            .get(name)
            .map(|n| n.id.clone())
            .unwrap_or_else(|| name.to_string())
    }

    /// Append a line at the given indent depth.
    pub fn add(&mut self, line: &str, indent: usize) {
        self.lines.push(format!("{}{}", " ".repeat(indent), line));
    }

    /// Human-friendly label: underscores to spaces, quotes escaped, then
    /// title-cased at every word boundary.
    pub fn format_label(&self, name: &str) -> String {
        let escaped = name.replace('_', " ").replace('"', "&quot;");
        let mut out = String::with_capacity(escaped.len());
        let mut at_boundary = true;
        for ch in escaped.chars() {
            if ch.is_alphabetic() {
                if at_boundary {
                    out.extend(ch.to_uppercase());
                } else {
                    out.push(ch);
                }
                at_boundary = false;
            } else {
                out.push(ch);
                at_boundary = true;
            }
        }
        out
    }
}
