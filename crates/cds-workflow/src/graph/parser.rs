use std::str::FromStr;

use super::label::EdgeLabel;
use super::model::Graph;
use crate::error::GraphParseError;

/// Parse the bracket notation `[src>dst/LABEL, ...]`.
///
/// A token without `>` declares a standalone node. Tokens are separated by
/// commas; whitespace around tokens and ids is ignored. Parsing is all or
/// nothing: the first bad token fails the whole graph.
pub fn parse_graph(text: &str) -> Result<Graph, GraphParseError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| GraphParseError::MissingBrackets(trimmed.to_string()))?;

    let mut graph = Graph::new();
    if body.trim().is_empty() {
        return Ok(graph);
    }

    for raw in body.split(',') {
        let token = raw.trim();
        if token.is_empty() {
            return Err(GraphParseError::EmptyNodeId(body.to_string()));
        }

        match token.split_once('>') {
            Some((source, rest)) => {
                let (target, label) = rest
                    .rsplit_once('/')
                    .ok_or_else(|| GraphParseError::MalformedEdge(token.to_string()))?;
                let (source, target, label) = (source.trim(), target.trim(), label.trim());

                if source.is_empty() || target.is_empty() {
                    return Err(GraphParseError::EmptyNodeId(token.to_string()));
                }
                if target.contains(&['>', '/'][..]) || source.contains('/') {
                    return Err(GraphParseError::MalformedEdge(token.to_string()));
                }

                let label: EdgeLabel = label.parse()?;
                graph.add_edge(source, target, label);
            }
            None => {
                if token.contains('/') {
                    return Err(GraphParseError::MalformedEdge(token.to_string()));
                }
                graph.add_node(token);
            }
        }
    }

    Ok(graph)
}

impl FromStr for Graph {
    type Err = GraphParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_graph(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::{END, START};

    #[test]
    fn test_parse_linear_chain() {
        let g = parse_graph("[START>A/SUCCESS, A>B/SUCCESS, B>END/SUCCESS]").unwrap();
        assert_eq!(g.edge_count(), 3);
        assert_eq!(g.nodes(), &[START, "A", "B", END]);
        assert_eq!(g.in_degree("B"), 1);
    }

    #[test]
    fn test_parse_keeps_same_pair_under_two_labels() {
        let g = parse_graph("[START>A/SUCCESS, A>B/SUCCESS, A>B/FAILURE, B>END/SUCCESS]").unwrap();
        assert_eq!(g.outgoing_edges("A").count(), 2);
        assert_eq!(g.in_degree("B"), 2);
    }

    #[test]
    fn test_parse_tolerates_whitespace() {
        let g = parse_graph("  [ START > A / SUCCESS ,A>END/failure ]  ").unwrap();
        assert_eq!(g.edge_count(), 2);
        assert!(g.contains_node("A"));
    }

    #[test]
    fn test_parse_standalone_node() {
        let g = parse_graph("[START>A/SUCCESS, ORPHAN]").unwrap();
        assert!(g.contains_node("ORPHAN"));
        assert_eq!(g.standalone_nodes(), vec!["ORPHAN"]);
    }

    #[test]
    fn test_parse_empty_graph() {
        let g = parse_graph("[]").unwrap();
        assert_eq!(g.node_count(), 0);
    }

    #[test]
    fn test_unknown_label_is_fatal() {
        let err = parse_graph("[START>A/SUCCESS, A>B/MAYBE]").unwrap_err();
        assert_eq!(err, GraphParseError::UnknownLabel("MAYBE".into()));
    }

    #[test]
    fn test_missing_brackets() {
        assert!(matches!(
            parse_graph("START>A/SUCCESS"),
            Err(GraphParseError::MissingBrackets(_))
        ));
    }

    #[test]
    fn test_malformed_tokens() {
        assert!(matches!(
            parse_graph("[START>A]"),
            Err(GraphParseError::MalformedEdge(_))
        ));
        assert!(matches!(
            parse_graph("[A/SUCCESS]"),
            Err(GraphParseError::MalformedEdge(_))
        ));
        assert!(matches!(
            parse_graph("[A>B>C/SUCCESS]"),
            Err(GraphParseError::MalformedEdge(_))
        ));
        assert!(matches!(
            parse_graph("[>B/SUCCESS]"),
            Err(GraphParseError::EmptyNodeId(_))
        ));
        assert!(matches!(
            parse_graph("[A>B/SUCCESS,]"),
            Err(GraphParseError::EmptyNodeId(_))
        ));
    }

    #[test]
    fn test_parse_is_idempotent() {
        let text = "[START>A/SUCCESS, A>B/SUCCESS, A>C/FAILURE, B>D/SUCCESS, C>D/SUCCESS, D>END/SUCCESS]";
        let first: Graph = text.parse().unwrap();
        let second: Graph = text.parse().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.nodes(), second.nodes());
    }

    #[test]
    fn test_display_round_trip() {
        let text = "[START>A/SUCCESS, A>B/DEFAULT, B>END/FAILURE, LONE]";
        let g = parse_graph(text).unwrap();
        assert_eq!(g.to_string(), text);
        assert_eq!(parse_graph(&g.to_string()).unwrap(), g);
    }
}
