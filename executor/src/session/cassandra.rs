use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use common::endpoint::Endpoint;
use common::error::Error as TopologyError;
use common::statement::{Batch, BulkStatement};
use common::token::{Partitioner, Token};
use common::token_range::TokenRange;
use common::topology::{TokenMap, TopologyProvider};
use scylla::batch::{Batch as CqlBatch, BatchType};
use scylla::frame::response::result::{CqlValue, Row};
use scylla::query::Query;
use scylla::transport::errors::{BrokenConnectionErrorKind, DbError, QueryError};
use scylla::transport::retry_policy::FallthroughRetryPolicy;
use scylla::transport::{PagingState, PagingStateResponse};
use scylla::SessionBuilder;
use tracing::{debug, info, warn};

use super::{Page, PagingOptions, Session, WriteAck};
use crate::error::{AbortCause, Error};
use crate::retry::RetryTarget;

static LOCAL_NODE_QUERY: &str = r#"
  SELECT host_id, rpc_address, tokens, partitioner FROM system.local
"#;

static PEER_NODES_QUERY: &str = r#"
  SELECT host_id, rpc_address, tokens FROM system.peers
"#;

const DEFAULT_CQL_PORT: u16 = 9042;

/// A CQL statement with bound values and optional routing information.
#[derive(Clone, Debug)]
pub struct CqlStatement {
    query: String,
    values: Vec<CqlValue>,
    routing_key: Option<Bytes>,
    routing_token: Option<Token>,
}

impl CqlStatement {
    pub fn new(query: impl Into<String>, values: Vec<CqlValue>) -> CqlStatement {
        CqlStatement {
            query: query.into(),
            values,
            routing_key: None,
            routing_token: None,
        }
    }

    /// Sets the serialized partition key, used to batch and route the
    /// statement.
    pub fn with_routing_key(mut self, key: impl Into<Bytes>) -> CqlStatement {
        self.routing_key = Some(key.into());
        self
    }

    pub fn with_routing_token(mut self, token: Token) -> CqlStatement {
        self.routing_token = Some(token);
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn values(&self) -> &[CqlValue] {
        &self.values
    }

    /// Statements scanning the rows of `range`. `select` is a query without
    /// a `WHERE` clause, such as `SELECT * FROM ks.table`, and
    /// `partition_key` the comma separated partition key columns. A range
    /// wrapping around the ring needs two statements.
    pub fn token_range_scans(select: &str, partition_key: &str, range: &TokenRange) -> Vec<CqlStatement> {
        let min = range.partitioner().min_token();
        let bounds: Vec<(Token, Token)> = if range.start() == range.end() {
            if *range.start() == min {
                vec![(min.clone(), min.clone())]
            } else {
                vec![
                    (range.start().clone(), min.clone()),
                    (min.clone(), range.end().clone()),
                ]
            }
        } else {
            range
                .unwrap()
                .into_iter()
                .map(|r| (r.start().clone(), r.end().clone()))
                .collect()
        };
        bounds
            .into_iter()
            .map(|(start, end)| {
                let query = if end == min {
                    format!("{} WHERE token({}) > {}", select, partition_key, start)
                } else {
                    format!(
                        "{} WHERE token({}) > {} AND token({}) <= {}",
                        select, partition_key, start, partition_key, end
                    )
                };
                CqlStatement::new(query, Vec::new()).with_routing_token(range.end().clone())
            })
            .collect()
    }
}

impl BulkStatement for CqlStatement {
    fn routing_token(&self) -> Option<Token> {
        self.routing_token.clone()
    }

    fn routing_key(&self) -> Option<Bytes> {
        self.routing_key.clone()
    }

    fn estimated_size_in_bytes(&self) -> usize {
        self.query.len() + self.values.iter().map(estimated_value_size).sum::<usize>()
    }
}

fn estimated_value_size(value: &CqlValue) -> usize {
    match value {
        CqlValue::Ascii(s) | CqlValue::Text(s) => s.len(),
        CqlValue::Blob(b) => b.len(),
        CqlValue::Boolean(_) | CqlValue::TinyInt(_) => 1,
        CqlValue::SmallInt(_) => 2,
        CqlValue::Int(_) | CqlValue::Float(_) => 4,
        CqlValue::Uuid(_) | CqlValue::Inet(_) => 16,
        CqlValue::List(values) | CqlValue::Set(values) => {
            values.iter().map(estimated_value_size).sum()
        }
        CqlValue::Map(entries) => entries
            .iter()
            .map(|(k, v)| estimated_value_size(k) + estimated_value_size(v))
            .sum(),
        CqlValue::Empty => 0,
        _ => 8,
    }
}

/// Session over the scylla driver. The driver's own retries are disabled so
/// that the executor's retry policy is the only one in effect; where an
/// attempt goes is left to the driver's load balancing.
///
/// The driver does not offer server push paging, so continuous paging is
/// served by regular paging with the same page size.
pub struct Cassandra {
    session: scylla::Session,
    port: u16,
    replication_factor: usize,
}

fn scylla_query_error_to_error(qe: QueryError) -> Error {
    match qe {
        QueryError::DbError(db_error, message) => match db_error {
            DbError::ReadTimeout { .. } => Error::ReadTimeout,
            DbError::WriteTimeout { .. } => Error::WriteTimeout,
            DbError::Unavailable { .. } => Error::Unavailable,
            DbError::ReadFailure { .. } => Error::ReadFailure,
            DbError::WriteFailure { .. } => Error::WriteFailure,
            DbError::SyntaxError
            | DbError::Invalid
            | DbError::Unauthorized
            | DbError::ConfigError
            | DbError::AlreadyExists { .. } => Error::InvalidStatement(message),
            _ => Error::Coordinator(message),
        },
        QueryError::BrokenConnection(e) => match e.downcast_ref::<BrokenConnectionErrorKind>() {
            Some(
                BrokenConnectionErrorKind::KeepaliveTimeout(_)
                | BrokenConnectionErrorKind::KeepaliveQueryError(_),
            ) => Error::RequestAborted(AbortCause::HeartbeatFailed),
            _ => Error::RequestAborted(AbortCause::ConnectionClosed),
        },
        // The connection went away under the request, or cannot carry it.
        QueryError::IoError(_)
        | QueryError::ConnectionPoolError(_)
        | QueryError::UnableToAllocStreamId
        | QueryError::TooManyOrphanedStreamIds(_) => {
            Error::RequestAborted(AbortCause::ConnectionClosed)
        }
        QueryError::TimeoutError | QueryError::RequestTimeout(_) => {
            Error::RequestAborted(AbortCause::Other)
        }
        QueryError::BadQuery(e) => Error::Encoding(e.to_string()),
        _ => Error::Internal(Arc::new(qe)),
    }
}

fn new_query(statement: &CqlStatement) -> Query {
    let mut query = Query::new(statement.query.clone());
    query.set_retry_policy(Some(Arc::new(FallthroughRetryPolicy::new())));
    query
}

/// Whether a write was applied. Only conditional writes answer with rows,
/// whose first column says whether the condition held.
fn was_applied(rows: Option<&Vec<Row>>) -> bool {
    let first_column = rows
        .and_then(|rows| rows.first())
        .and_then(|row| row.columns.first());
    !matches!(first_column, Some(Some(CqlValue::Boolean(false))))
}

impl Cassandra {
    pub async fn new(known_node: String, replication_factor: usize) -> Result<Cassandra, Error> {
        let port = known_node
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(DEFAULT_CQL_PORT);
        let session = SessionBuilder::new()
            .known_node(&known_node)
            .build()
            .await
            .map_err(|e| Error::Internal(Arc::new(e)))?;
        info!("Connected to cluster through {}.", known_node);
        Ok(Cassandra {
            session,
            port,
            replication_factor: replication_factor.max(1),
        })
    }

    async fn system_rows(&self, query: &str) -> Result<Vec<Row>, TopologyError> {
        let result = self
            .session
            .query_unpaged(query, ())
            .await
            .map_err(|e| TopologyError::TopologyUnavailable(e.to_string()))?;
        Ok(result.rows.unwrap_or_default())
    }

    fn parse_node(&self, row: &Row, partitioner: Partitioner) -> Option<(Endpoint, Vec<Token>)> {
        let host_id = match row.columns.first() {
            Some(Some(CqlValue::Uuid(id))) => id.to_string(),
            _ => return None,
        };
        let address = match row.columns.get(1) {
            Some(Some(CqlValue::Inet(ip))) => SocketAddr::new(*ip, self.port),
            _ => return None,
        };
        let tokens = match row.columns.get(2) {
            Some(Some(CqlValue::Set(values))) => values
                .iter()
                .filter_map(|value| match value {
                    CqlValue::Text(t) | CqlValue::Ascii(t) => partitioner.parse_token(t).ok(),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        Some((Endpoint::new(host_id, address), tokens))
    }
}

/// Places replicas the way `SimpleStrategy` does: the owner of each token
/// followed by the owners of the next tokens clockwise, skipping nodes
/// already chosen.
fn simple_strategy_ring(
    nodes: Vec<(Endpoint, Vec<Token>)>,
    replication_factor: usize,
) -> Vec<(Token, Vec<Endpoint>)> {
    let mut ring: Vec<(Token, Endpoint)> = nodes
        .into_iter()
        .flat_map(|(endpoint, tokens)| tokens.into_iter().map(move |t| (t, endpoint.clone())))
        .collect();
    ring.sort_by(|a, b| a.0.cmp(&b.0));
    let distinct: BTreeSet<&Endpoint> = ring.iter().map(|(_, e)| e).collect();
    let wanted = replication_factor.min(distinct.len());
    (0..ring.len())
        .map(|i| {
            let mut replicas: Vec<Endpoint> = Vec::with_capacity(wanted);
            for j in 0..ring.len() {
                if replicas.len() == wanted {
                    break;
                }
                let candidate = &ring[(i + j) % ring.len()].1;
                if !replicas.contains(candidate) {
                    replicas.push(candidate.clone());
                }
            }
            (ring[i].0.clone(), replicas)
        })
        .collect()
}

impl TopologyProvider for Cassandra {
    async fn token_map(&self) -> Result<TokenMap, TopologyError> {
        let local = self.system_rows(LOCAL_NODE_QUERY).await?;
        let partitioner = match local.first().and_then(|row| row.columns.get(3)) {
            Some(Some(CqlValue::Text(name))) => Partitioner::from_str(name)?,
            _ => {
                return Err(TopologyError::TopologyUnavailable(
                    "system.local does not name a partitioner".to_string(),
                ))
            }
        };
        let peers = self.system_rows(PEER_NODES_QUERY).await?;
        let nodes: Vec<(Endpoint, Vec<Token>)> = local
            .iter()
            .chain(peers.iter())
            .filter_map(|row| {
                let node = self.parse_node(row, partitioner);
                if node.is_none() {
                    warn!("Skipping a node with incomplete metadata.");
                }
                node
            })
            .collect();
        debug!("Cluster has {} nodes.", nodes.len());
        TokenMap::from_token_ring(
            partitioner,
            simple_strategy_ring(nodes, self.replication_factor),
        )
    }
}

impl Session for Cassandra {
    type Statement = CqlStatement;
    type Row = Row;
    type PagingState = PagingState;

    async fn execute(&self, statement: &CqlStatement, target: RetryTarget) -> Result<WriteAck, Error> {
        debug!("Executing statement ({} attempt).", target);
        let result = self
            .session
            .query_unpaged(new_query(statement), &statement.values)
            .await
            .map_err(scylla_query_error_to_error)?;
        Ok(WriteAck {
            applied: was_applied(result.rows.as_ref()),
        })
    }

    async fn execute_batch(
        &self,
        batch: &Batch<CqlStatement>,
        target: RetryTarget,
    ) -> Result<WriteAck, Error> {
        debug!("Executing batch of {} statements ({} attempt).", batch.len(), target);
        let mut cql_batch = CqlBatch::new(BatchType::Unlogged);
        cql_batch.set_retry_policy(Some(Arc::new(FallthroughRetryPolicy::new())));
        for statement in batch.statements() {
            cql_batch.append_statement(Query::new(statement.query.clone()));
        }
        let values: Vec<&Vec<CqlValue>> = batch.statements().iter().map(|s| &s.values).collect();
        let result = self
            .session
            .batch(&cql_batch, values)
            .await
            .map_err(scylla_query_error_to_error)?;
        Ok(WriteAck {
            applied: was_applied(result.rows.as_ref()),
        })
    }

    async fn fetch_page(
        &self,
        statement: &CqlStatement,
        paging_state: Option<PagingState>,
        options: &PagingOptions,
        target: RetryTarget,
    ) -> Result<Page<Row, PagingState>, Error> {
        debug!("Fetching page ({} attempt).", target);
        let mut query = new_query(statement);
        query.set_page_size(options.page_size.max(1));
        let (result, response) = self
            .session
            .query_single_page(
                query,
                &statement.values,
                paging_state.unwrap_or_else(PagingState::start),
            )
            .await
            .map_err(scylla_query_error_to_error)?;
        let paging_state = match response {
            PagingStateResponse::HasMorePages { state } => Some(state),
            PagingStateResponse::NoMorePages => None,
        };
        Ok(Page {
            rows: result.rows.unwrap_or_default(),
            paging_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureCategory;
    use common::for_testing::endpoint;
    use scylla::transport::errors::ConnectionPoolError;
    use std::net::{IpAddr, Ipv4Addr};

    fn murmur3_range(start: i64, end: i64) -> TokenRange {
        TokenRange::new(
            Partitioner::Murmur3,
            Token::Murmur3(start),
            Token::Murmur3(end),
            BTreeSet::new(),
        )
    }

    fn queries(range: &TokenRange) -> Vec<String> {
        CqlStatement::token_range_scans("SELECT * FROM ks.t", "id", range)
            .iter()
            .map(|s| s.query().to_string())
            .collect()
    }

    #[test]
    fn scan_of_plain_range() {
        assert_eq!(
            queries(&murmur3_range(-10, 20)),
            vec!["SELECT * FROM ks.t WHERE token(id) > -10 AND token(id) <= 20"]
        );
    }

    #[test]
    fn scan_of_wrapping_range() {
        assert_eq!(
            queries(&murmur3_range(100, -100)),
            vec![
                "SELECT * FROM ks.t WHERE token(id) > 100",
                "SELECT * FROM ks.t WHERE token(id) > -9223372036854775808 AND token(id) <= -100",
            ]
        );
    }

    #[test]
    fn scan_of_full_ring() {
        assert_eq!(
            queries(&murmur3_range(i64::MIN, i64::MIN)),
            vec!["SELECT * FROM ks.t WHERE token(id) > -9223372036854775808"]
        );
        assert_eq!(queries(&murmur3_range(5, 5)).len(), 2);
    }

    #[test]
    fn scans_route_to_range_end() {
        let scans = CqlStatement::token_range_scans("SELECT * FROM ks.t", "id", &murmur3_range(100, -100));
        assert!(scans
            .iter()
            .all(|s| s.routing_token() == Some(Token::Murmur3(-100))));
    }

    #[test]
    fn size_estimate_counts_values() {
        let statement = CqlStatement::new(
            "INSERT INTO ks.t (id, v) VALUES (?, ?)",
            vec![CqlValue::BigInt(1), CqlValue::Text("hello".to_string())],
        );
        assert_eq!(statement.estimated_size_in_bytes(), 38 + 8 + 5);
    }

    #[test]
    fn replicas_follow_ring_order() {
        let nodes = vec![
            (endpoint(1), vec![Token::Murmur3(0), Token::Murmur3(300)]),
            (endpoint(2), vec![Token::Murmur3(100)]),
            (endpoint(3), vec![Token::Murmur3(200)]),
        ];
        let ring = simple_strategy_ring(nodes, 2);
        let expected: Vec<(Token, Vec<Endpoint>)> = vec![
            (Token::Murmur3(0), vec![endpoint(1), endpoint(2)]),
            (Token::Murmur3(100), vec![endpoint(2), endpoint(3)]),
            (Token::Murmur3(200), vec![endpoint(3), endpoint(1)]),
            // Wraps around and skips node1's other token.
            (Token::Murmur3(300), vec![endpoint(1), endpoint(2)]),
        ];
        assert_eq!(ring, expected);
    }

    #[test]
    fn replication_factor_is_capped_by_cluster_size() {
        let nodes = vec![(endpoint(1), vec![Token::Murmur3(0)])];
        let ring = simple_strategy_ring(nodes, 3);
        assert_eq!(ring[0].1.len(), 1);
    }

    #[test]
    fn conditional_write_not_applied() {
        let rejected = vec![Row {
            columns: vec![Some(CqlValue::Boolean(false))],
        }];
        assert!(!was_applied(Some(&rejected)));
        assert!(was_applied(None));
    }

    #[test]
    fn driver_errors_are_classified() {
        assert!(matches!(
            scylla_query_error_to_error(QueryError::DbError(DbError::SyntaxError, "line 1".into())),
            Error::InvalidStatement(_)
        ));
        assert!(matches!(
            scylla_query_error_to_error(QueryError::DbError(DbError::Overloaded, "busy".into())),
            Error::Coordinator(_)
        ));
        assert!(matches!(
            scylla_query_error_to_error(QueryError::TimeoutError),
            Error::RequestAborted(AbortCause::Other)
        ));
    }

    #[test]
    fn lost_connections_are_aborts() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        for qe in [
            QueryError::IoError(Arc::new(reset)),
            QueryError::ConnectionPoolError(ConnectionPoolError::Initializing),
            QueryError::UnableToAllocStreamId,
            QueryError::TooManyOrphanedStreamIds(5),
        ] {
            assert!(matches!(
                scylla_query_error_to_error(qe),
                Error::RequestAborted(AbortCause::ConnectionClosed)
            ));
        }
    }

    #[test]
    fn keepalive_failures_are_heartbeat_aborts() {
        let timeout = BrokenConnectionErrorKind::KeepaliveTimeout(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let error = scylla_query_error_to_error(QueryError::BrokenConnection(timeout.into()));
        assert_eq!(
            error.category(),
            FailureCategory::Aborted(AbortCause::HeartbeatFailed)
        );
    }
}
