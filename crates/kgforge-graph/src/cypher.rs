//! Cypher statement builders.
//!
//! Data values are always bound as parameters. Labels, relationship types
//! and property keys occupy structural positions that Cypher cannot
//! parameterize, so every builder validates them with
//! [`ensure_safe`] before splicing and fails with
//! [`ItemError::UnsafeIdentifier`] otherwise.

use serde_json::{Map, Value};

use kgforge_core::identifier::ensure_safe;
use kgforge_core::{ItemError, NodeUpsert, Properties, RelationshipUpsert};

use crate::executor::{Operation, Statement};

fn properties_param(properties: &Properties) -> Value {
    Value::Object(properties.clone().into_iter().collect::<Map<String, Value>>())
}

/// `(var:Label {key: $param})`, or `(var {key: $param})` without a label.
fn node_pattern(
    var: &str,
    label: Option<&str>,
    key: &str,
    param: &str,
) -> Result<String, ItemError> {
    let key = ensure_safe(key)?;
    Ok(match label {
        Some(label) => format!("({var}:{} {{{key}: {param}}})", ensure_safe(label)?),
        None => format!("({var} {{{key}: {param}}})"),
    })
}

fn node_upsert_properties(node: &NodeUpsert) -> Properties {
    let mut properties = node.properties.clone();
    properties.insert(
        node.identity_key.clone(),
        Value::String(node.identity_value.clone()),
    );
    properties
}

// ── Nodes ────────────────────────────────────────────────────────

/// MERGE a single node by identity, overlaying its properties.
pub fn merge_node(node: &NodeUpsert) -> Result<Statement, ItemError> {
    let pattern = node_pattern("n", Some(&node.label), &node.identity_key, "$identity")?;
    let cypher = format!(
        "MERGE {pattern}
         ON CREATE SET n += $properties
         ON MATCH SET n += $properties"
    );

    Ok(Statement::new(
        cypher,
        Operation::MergeNode {
            label: node.label.clone(),
            key: node.identity_key.clone(),
        },
    )
    .param("identity", node.identity_value.clone())
    .param("properties", properties_param(&node_upsert_properties(node))))
}

/// MERGE many nodes sharing one label and identity key with a single UNWIND.
pub fn merge_nodes(label: &str, key: &str, nodes: &[&NodeUpsert]) -> Result<Statement, ItemError> {
    let pattern = node_pattern("n", Some(label), key, "row.identity")?;
    let cypher = format!(
        "UNWIND $rows AS row
         MERGE {pattern}
         ON CREATE SET n += row.properties
         ON MATCH SET n += row.properties"
    );

    let rows: Vec<Value> = nodes
        .iter()
        .map(|node| {
            serde_json::json!({
                "identity": node.identity_value,
                "properties": properties_param(&node_upsert_properties(node)),
            })
        })
        .collect();

    Ok(Statement::new(
        cypher,
        Operation::MergeNodes {
            label: label.to_string(),
            key: key.to_string(),
        },
    )
    .param("rows", rows))
}

// ── Relationships ────────────────────────────────────────────────

/// MATCH both endpoints by `key` and MERGE the relationship between them.
///
/// Returns one row with `merged`; zero means an endpoint was missing.
pub fn merge_relationship(rel: &RelationshipUpsert, key: &str) -> Result<Statement, ItemError> {
    let rel_type = ensure_safe(&rel.rel_type)?;
    let from = node_pattern("a", rel.from_label.as_deref(), key, "$from")?;
    let to = node_pattern("b", rel.to_label.as_deref(), key, "$to")?;
    let cypher = format!(
        "MATCH {from}
         MATCH {to}
         MERGE (a)-[r:{rel_type}]->(b)
         ON CREATE SET r += $properties
         ON MATCH SET r += $properties
         RETURN count(r) AS merged"
    );

    Ok(Statement::new(
        cypher,
        Operation::MergeRelationship {
            rel_type: rel.rel_type.clone(),
            from_label: rel.from_label.clone(),
            to_label: rel.to_label.clone(),
            key: key.to_string(),
        },
    )
    .param("from", rel.from_identity.clone())
    .param("to", rel.to_identity.clone())
    .param("properties", properties_param(&rel.properties)))
}

/// Batched form of [`merge_relationship`] for relationships sharing a type
/// and endpoint labels. Each row carries its `index`; the statement returns
/// the index of every row whose endpoints matched.
pub fn merge_relationships(
    rel_type: &str,
    from_label: Option<&str>,
    to_label: Option<&str>,
    key: &str,
    rows: &[(usize, &RelationshipUpsert)],
) -> Result<Statement, ItemError> {
    let safe_type = ensure_safe(rel_type)?;
    let from = node_pattern("a", from_label, key, "row.from")?;
    let to = node_pattern("b", to_label, key, "row.to")?;
    let cypher = format!(
        "UNWIND $rows AS row
         MATCH {from}
         MATCH {to}
         MERGE (a)-[r:{safe_type}]->(b)
         ON CREATE SET r += row.properties
         ON MATCH SET r += row.properties
         RETURN DISTINCT row.index AS index"
    );

    let rows: Vec<Value> = rows
        .iter()
        .map(|(index, rel)| {
            serde_json::json!({
                "index": index,
                "from": rel.from_identity,
                "to": rel.to_identity,
                "properties": properties_param(&rel.properties),
            })
        })
        .collect();

    Ok(Statement::new(
        cypher,
        Operation::MergeRelationships {
            rel_type: rel_type.to_string(),
            from_label: from_label.map(str::to_string),
            to_label: to_label.map(str::to_string),
            key: key.to_string(),
        },
    )
    .param("rows", rows))
}

/// Connect every `(a:From)` to every `(b:To)` where `a.from_property = b.to_property`.
pub fn link_by_property(
    rel_type: &str,
    from_label: &str,
    to_label: &str,
    from_property: &str,
    to_property: &str,
    properties: &Properties,
) -> Result<Statement, ItemError> {
    let cypher = format!(
        "MATCH (a:{from_label}), (b:{to_label})
         WHERE a.{from_property} = b.{to_property}
         MERGE (a)-[r:{rel_type}]->(b)
         ON CREATE SET r += $properties
         ON MATCH SET r += $properties
         RETURN count(r) AS linked",
        from_label = ensure_safe(from_label)?,
        to_label = ensure_safe(to_label)?,
        from_property = ensure_safe(from_property)?,
        to_property = ensure_safe(to_property)?,
        rel_type = ensure_safe(rel_type)?,
    );

    Ok(Statement::new(
        cypher,
        Operation::LinkByProperty {
            rel_type: rel_type.to_string(),
            from_label: from_label.to_string(),
            to_label: to_label.to_string(),
            from_property: from_property.to_string(),
            to_property: to_property.to_string(),
        },
    )
    .param("properties", properties_param(properties)))
}

// ── Schema ───────────────────────────────────────────────────────

/// Constraint name used for a `(label, property)` uniqueness constraint.
pub fn constraint_name(label: &str, property: &str) -> String {
    format!("{label}_{property}_unique").to_lowercase()
}

/// Declare a uniqueness constraint if it does not already exist.
pub fn create_unique_constraint(label: &str, property: &str) -> Result<Statement, ItemError> {
    let label = ensure_safe(label)?;
    let property = ensure_safe(property)?;
    let name = constraint_name(label, property);
    let cypher = format!(
        "CREATE CONSTRAINT {name} IF NOT EXISTS FOR (n:{label}) REQUIRE n.{property} IS UNIQUE"
    );

    Ok(Statement::new(
        cypher,
        Operation::CreateUniqueConstraint {
            label: label.to_string(),
            property: property.to_string(),
        },
    ))
}

// ── Reads ────────────────────────────────────────────────────────

pub fn count_nodes(label: Option<&str>) -> Result<Statement, ItemError> {
    let cypher = match label {
        Some(label) => format!("MATCH (n:{}) RETURN count(n) AS count", ensure_safe(label)?),
        None => "MATCH (n) RETURN count(n) AS count".to_string(),
    };
    Ok(Statement::new(
        cypher,
        Operation::CountNodes {
            label: label.map(str::to_string),
        },
    ))
}

pub fn count_relationships(rel_type: Option<&str>) -> Result<Statement, ItemError> {
    let cypher = match rel_type {
        Some(rel_type) => format!(
            "MATCH ()-[r:{}]->() RETURN count(r) AS count",
            ensure_safe(rel_type)?
        ),
        None => "MATCH ()-[r]->() RETURN count(r) AS count".to_string(),
    };
    Ok(Statement::new(
        cypher,
        Operation::CountRelationships {
            rel_type: rel_type.map(str::to_string),
        },
    ))
}

pub fn find_node(label: &str, key: &str, value: &str) -> Result<Statement, ItemError> {
    let pattern = node_pattern("n", Some(label), key, "$value")?;
    let cypher = format!("MATCH {pattern} RETURN properties(n) AS properties");
    Ok(Statement::new(
        cypher,
        Operation::FindNode {
            label: label.to_string(),
            key: key.to_string(),
        },
    )
    .param("value", value.to_string()))
}

pub fn node_properties(label: &str) -> Result<Statement, ItemError> {
    let label = ensure_safe(label)?;
    Ok(Statement::new(
        format!("MATCH (n:{label}) RETURN properties(n) AS properties"),
        Operation::NodeProperties {
            label: label.to_string(),
        },
    ))
}

pub fn relationship_properties(rel_type: &str) -> Result<Statement, ItemError> {
    let rel_type = ensure_safe(rel_type)?;
    Ok(Statement::new(
        format!("MATCH ()-[r:{rel_type}]->() RETURN type(r) AS type, properties(r) AS properties"),
        Operation::RelationshipProperties {
            rel_type: rel_type.to_string(),
        },
    ))
}

/// List constraints, optionally only those on `label`.
pub fn show_constraints(label: Option<&str>) -> Result<Statement, ItemError> {
    let filter = match label {
        Some(label) => format!(" WHERE '{}' IN labelsOrTypes", ensure_safe(label)?),
        None => String::new(),
    };
    let cypher = format!(
        "SHOW CONSTRAINTS YIELD name, labelsOrTypes, properties{filter} \
         RETURN name, labelsOrTypes AS labels, properties"
    );
    Ok(Statement::new(
        cypher,
        Operation::ShowConstraints {
            label: label.map(str::to_string),
        },
    ))
}

pub fn show_databases() -> Statement {
    Statement::new("SHOW DATABASES YIELD name RETURN name", Operation::ShowDatabases)
}

// ── Deletes ──────────────────────────────────────────────────────

/// Detach-delete nodes, optionally restricted to a label and to nodes that
/// carry `having_property`. With neither, the whole graph is cleared.
pub fn delete_nodes(
    label: Option<&str>,
    having_property: Option<&str>,
) -> Result<Statement, ItemError> {
    let pattern = match label {
        Some(label) => format!("(n:{})", ensure_safe(label)?),
        None => "(n)".to_string(),
    };
    let filter = match having_property {
        Some(property) => format!(" WHERE n.{} IS NOT NULL", ensure_safe(property)?),
        None => String::new(),
    };
    Ok(Statement::new(
        format!("MATCH {pattern}{filter} DETACH DELETE n RETURN count(n) AS deleted"),
        Operation::DeleteNodes {
            label: label.map(str::to_string),
            having_property: having_property.map(str::to_string),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn squash(cypher: &str) -> String {
        cypher.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn merge_node_binds_values_as_params() {
        let mut props = Properties::new();
        props.insert("age".into(), json!("30"));
        let node = NodeUpsert::new("Person", "name", "Alice", props);

        let stmt = merge_node(&node).unwrap();
        assert_eq!(
            squash(&stmt.cypher),
            "MERGE (n:Person {name: $identity}) ON CREATE SET n += $properties ON MATCH SET n += $properties"
        );
        assert_eq!(stmt.params["identity"], json!("Alice"));
        assert_eq!(stmt.params["properties"], json!({"name": "Alice", "age": "30"}));
        assert!(!stmt.cypher.contains("Alice"));
    }

    #[test]
    fn unsafe_label_never_reaches_query_text() {
        let node = NodeUpsert::new("Foo; DROP", "name", "x", Properties::new());
        assert_eq!(
            merge_node(&node).unwrap_err(),
            ItemError::UnsafeIdentifier {
                value: "Foo; DROP".into()
            }
        );

        let node = NodeUpsert::new("Person", "name}) DETACH DELETE n //", "x", Properties::new());
        assert!(merge_node(&node).is_err());
    }

    #[test]
    fn merge_relationship_with_and_without_labels() {
        let rel = RelationshipUpsert::new("CONTAINS", "G1", "B1");
        let stmt = merge_relationship(&rel, "name").unwrap();
        assert!(squash(&stmt.cypher).starts_with(
            "MATCH (a {name: $from}) MATCH (b {name: $to}) MERGE (a)-[r:CONTAINS]->(b)"
        ));
        assert_eq!(stmt.params["from"], json!("G1"));

        let rel = rel.with_labels(Some("Genome".into()), Some("BGC".into()));
        let stmt = merge_relationship(&rel, "id").unwrap();
        assert!(squash(&stmt.cypher)
            .starts_with("MATCH (a:Genome {id: $from}) MATCH (b:BGC {id: $to})"));
        assert!(stmt.cypher.contains("RETURN count(r) AS merged"));
    }

    #[test]
    fn unsafe_relationship_type_is_rejected() {
        let rel = RelationshipUpsert::new("KNOWS]->(x) DELETE x //", "a", "b");
        assert!(matches!(
            merge_relationship(&rel, "name"),
            Err(ItemError::UnsafeIdentifier { .. })
        ));
        let rel = RelationshipUpsert::new("KNOWS", "a", "b").with_labels(Some("A B".into()), None);
        assert!(merge_relationship(&rel, "name").is_err());
    }

    #[test]
    fn batched_statements_carry_rows() {
        let a = NodeUpsert::new("Genome", "name", "G1", Properties::new());
        let b = NodeUpsert::new("Genome", "name", "G2", Properties::new());
        let stmt = merge_nodes("Genome", "name", &[&a, &b]).unwrap();
        assert!(stmt.cypher.starts_with("UNWIND $rows AS row"));
        assert_eq!(stmt.params["rows"][1]["identity"], json!("G2"));

        let r = RelationshipUpsert::new("CONTAINS", "G1", "B1");
        let stmt = merge_relationships("CONTAINS", None, Some("BGC"), "name", &[(4, &r)]).unwrap();
        assert!(stmt.cypher.contains("RETURN DISTINCT row.index AS index"));
        assert_eq!(stmt.params["rows"][0]["index"], json!(4));
    }

    #[test]
    fn constraint_statement() {
        let stmt = create_unique_constraint("Genome", "name").unwrap();
        assert_eq!(
            stmt.cypher,
            "CREATE CONSTRAINT genome_name_unique IF NOT EXISTS FOR (n:Genome) REQUIRE n.name IS UNIQUE"
        );
        assert!(create_unique_constraint("Genome", "na me").is_err());
    }

    #[test]
    fn link_by_property_statement() {
        let stmt = link_by_property(
            "PARTICIPATES_IN",
            "Compound",
            "Reaction",
            "id",
            "compound_id",
            &Properties::new(),
        )
        .unwrap();
        assert!(squash(&stmt.cypher).starts_with(
            "MATCH (a:Compound), (b:Reaction) WHERE a.id = b.compound_id MERGE (a)-[r:PARTICIPATES_IN]->(b)"
        ));
    }

    #[test]
    fn delete_statements_are_scoped() {
        let stmt = delete_nodes(Some("Genome"), Some("test")).unwrap();
        assert_eq!(
            stmt.cypher,
            "MATCH (n:Genome) WHERE n.test IS NOT NULL DETACH DELETE n RETURN count(n) AS deleted"
        );
        assert_eq!(
            delete_nodes(None, None).unwrap().cypher,
            "MATCH (n) DETACH DELETE n RETURN count(n) AS deleted"
        );
        assert!(delete_nodes(Some("Genome) DETACH DELETE (m"), None).is_err());
        assert!(delete_nodes(None, Some("x IS NULL OR true")).is_err());
    }

    #[test]
    fn constraint_listing_filters_by_label() {
        let stmt = show_constraints(Some("BGC")).unwrap();
        assert_eq!(
            stmt.cypher,
            "SHOW CONSTRAINTS YIELD name, labelsOrTypes, properties WHERE 'BGC' IN labelsOrTypes RETURN name, labelsOrTypes AS labels, properties"
        );
        assert!(show_constraints(Some("x' OR true //")).is_err());
        assert!(!show_constraints(None).unwrap().cypher.contains("WHERE"));
    }
}
