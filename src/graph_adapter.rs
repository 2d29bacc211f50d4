// Neo4j graph adapter. Extracts candidate entity names from the query text,
// runs intent-shaped Cypher over the code graph, and flattens rows into
// directed relationship triples with traversal paths.

use anyhow::{Context, Result};
use async_trait::async_trait;
use neo4rs::{Graph, Query};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

use crate::contracts::StructuralSearcher;
use crate::http_types::StructuralRelationship;
use crate::types::{ProjectScope, QueryIntent};

/// Default deadline for substantive graph calls.
pub const GRAPH_TIMEOUT: Duration = Duration::from_secs(30);

/// Short deadline for availability probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_RELATIONSHIPS: i64 = 25;

// CamelCase identifiers ("AuthService") and multi-segment snake_case
// ("token_store") are the entity shapes the indexers emit.
static CAMEL_IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][a-z0-9]+(?:[A-Z][a-z0-9]+)*\b").expect("static regex"));
static SNAKE_IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-z][a-z0-9]*(?:_[a-z0-9]+)+\b").expect("static regex"));
static QUOTED_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new("`([^`]+)`").expect("static regex"));

// Sentence-starting words that match the CamelCase shape but are never entities.
const ENTITY_STOPWORDS: &[&str] = &[
    "what", "where", "which", "who", "why", "how", "show", "find", "list", "explain", "does",
    "the", "and", "are", "can", "give", "tell",
];

/// Pull candidate entity names out of free-form query text, deduplicated and
/// in deterministic order.
pub fn extract_entities(query: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    for capture in QUOTED_IDENT.captures_iter(query) {
        seen.insert(capture[1].to_string());
    }
    for m in CAMEL_IDENT.find_iter(query) {
        if !ENTITY_STOPWORDS.contains(&m.as_str().to_lowercase().as_str()) {
            seen.insert(m.as_str().to_string());
        }
    }
    for m in SNAKE_IDENT.find_iter(query) {
        seen.insert(m.as_str().to_string());
    }
    seen.into_iter().collect()
}

/// Bolt client over the labeled property graph.
pub struct Neo4jAdapter {
    graph: Graph,
}

impl Neo4jAdapter {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let graph = Graph::new(uri, user, password)
            .await
            .context("failed to connect to graph backend")?;
        Ok(Self { graph })
    }

    fn cypher_for(intent: QueryIntent, reverse: bool) -> &'static str {
        // Dependents are incoming edges; everything else walks outgoing ones.
        if reverse {
            "MATCH (s:Entity)-[r]->(t:Entity {name: $name}) \
             WHERE ($project = '' OR t.project = $project) \
             RETURN s.name AS source, type(r) AS relation, t.name AS target \
             LIMIT $limit"
        } else {
            match intent {
                QueryIntent::Relationship | QueryIntent::Both => {
                    "MATCH (s:Entity {name: $name})-[r]->(t:Entity) \
                     WHERE ($project = '' OR s.project = $project) \
                     RETURN s.name AS source, type(r) AS relation, t.name AS target \
                     LIMIT $limit"
                }
                _ => {
                    "MATCH (s:Entity {name: $name})-[r:CALLS|IMPORTS|IMPLEMENTS|EXTENDS]->(t:Entity) \
                     WHERE ($project = '' OR s.project = $project) \
                     RETURN s.name AS source, type(r) AS relation, t.name AS target \
                     LIMIT $limit"
                }
            }
        }
    }

    async fn run_query(
        &self,
        cypher: &'static str,
        entity: &str,
        project: Option<&ProjectScope>,
    ) -> Result<Vec<StructuralRelationship>> {
        let query = Query::new(cypher.to_string())
            .param("name", entity)
            .param(
                "project",
                project.map(|p| p.as_str().to_string()).unwrap_or_default(),
            )
            .param("limit", MAX_RELATIONSHIPS);

        let mut result = self
            .graph
            .execute(query)
            .await
            .context("graph query failed")?;

        let mut relationships = Vec::new();
        while let Some(row) = result.next().await.context("graph row read failed")? {
            if let (Ok(source), Ok(relation), Ok(target)) = (
                row.get::<String>("source"),
                row.get::<String>("relation"),
                row.get::<String>("target"),
            ) {
                relationships.push(build_relationship(source, relation, target));
            }
        }
        Ok(relationships)
    }
}

fn build_relationship(source: String, relation: String, target: String) -> StructuralRelationship {
    let explanation = Some(explain_relation(&source, &relation, &target));
    let path = vec![source.clone(), relation.clone(), target.clone()];
    StructuralRelationship {
        source,
        relation,
        target,
        path,
        explanation,
    }
}

fn explain_relation(source: &str, relation: &str, target: &str) -> String {
    match relation {
        "CALLS" => format!("{source} calls {target}"),
        "IMPORTS" => format!("{source} imports {target}"),
        "IMPLEMENTS" => format!("{source} implements {target}"),
        "EXTENDS" => format!("{source} extends {target}"),
        "DEPENDS_ON" => format!("{source} depends on {target}"),
        _ => format!("{source} is related to {target} via {relation}"),
    }
}

/// "what depends on X" and "who uses X" walk the graph against edge direction.
fn wants_dependents(query: &str) -> bool {
    let lowered = query.to_lowercase();
    lowered.contains("depends on")
        || lowered.contains("depend on")
        || lowered.contains("used by")
        || lowered.contains("callers")
        || lowered.contains("who calls")
        || lowered.contains("what calls")
}

#[async_trait]
impl StructuralSearcher for Neo4jAdapter {
    async fn search(
        &self,
        query: &str,
        intent: QueryIntent,
        project: Option<&ProjectScope>,
    ) -> Result<Vec<StructuralRelationship>> {
        let entities = extract_entities(query);
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let reverse = wants_dependents(query);
        let cypher = Self::cypher_for(intent, reverse);

        let mut relationships = Vec::new();
        for entity in &entities {
            let mut batch = self.run_query(cypher, entity, project).await?;
            relationships.append(&mut batch);
            if relationships.len() as i64 >= MAX_RELATIONSHIPS {
                relationships.truncate(MAX_RELATIONSHIPS as usize);
                break;
            }
        }

        debug!(
            entities = entities.len(),
            relationships = relationships.len(),
            "graph search completed"
        );
        Ok(relationships)
    }

    async fn probe(&self) -> bool {
        let ping = async {
            let mut result = self.graph.execute(Query::new("RETURN 1".to_string())).await?;
            result.next().await?;
            Ok::<_, neo4rs::Error>(())
        };
        matches!(tokio::time::timeout(PROBE_TIMEOUT, ping).await, Ok(Ok(())))
    }
}
