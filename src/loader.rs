use std::fs;
use std::path::Path;

use crate::error::GraphError;
use crate::graph::GraphInfo;

/// Reads a JSON graph description from disk.
pub fn load_graph_from_path(path: impl AsRef<Path>) -> Result<GraphInfo, GraphError> {
    let path = path.as_ref();
    let contents =
        fs::read_to_string(path).map_err(|err| GraphError::io(path.to_path_buf(), err))?;
    let graph: GraphInfo = serde_json::from_str(&contents)?;
    log::debug!(
        "Loaded `{}`: {} operands, {} operations",
        path.display(),
        graph.operands.len(),
        graph.operations.len()
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reports_path() {
        let err = load_graph_from_path("/nonexistent/graph.json").unwrap_err();
        match err {
            GraphError::Io { path, .. } => assert!(path.ends_with("graph.json")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let path = std::env::temp_dir().join("qconv_import_invalid_graph.json");
        fs::write(&path, "{ not json").unwrap();
        let err = load_graph_from_path(&path).unwrap_err();
        let _ = fs::remove_file(&path);
        assert!(matches!(err, GraphError::Json(_)));
    }
}
