//! Query Runner Tests
//!
//! Only queries the store cannot answer are sent; each response is written
//! as it arrives; refetches rebuild a query from the record's stored path.

mod common;

#[cfg(test)]
mod query_runner_tests {
    use super::common::{self, mock_network, scalar, user_payload, user_query, NetworkHandle};
    use anyhow::Result;
    use nodespace_sync::models::{Fragment, FragmentPointer, Variables};
    use nodespace_sync::network::{NetworkError, QueryRequest};
    use nodespace_sync::services::QueryError;
    use nodespace_sync::{Environment, StoreConfig};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn environment(batch: bool) -> Result<(Environment, NetworkHandle)> {
        common::init_tracing();
        let (network, handle) = mock_network(batch);
        Ok((Environment::new(StoreConfig::default(), network)?, handle))
    }

    fn request(id: &str) -> Result<QueryRequest> {
        Ok(QueryRequest::new(user_query(id)?, Variables::new()))
    }

    #[tokio::test]
    async fn test_cached_queries_are_not_sent() -> Result<()> {
        let (env, mut network) = environment(false)?;
        env.handle_query_payload(&user_query("1")?, &Variables::new(), &user_payload("1", "Ada"))?;

        let (summary, answered) = tokio::join!(
            env.run_queries(vec![request("1")?, request("2")?]),
            async {
                let pending = network.next_query().await?;
                let id = pending
                    .request
                    .query
                    .identifying_ids(&pending.request.variables)?
                    .unwrap_or_default();
                pending.resolve(user_payload("2", "Grace"));
                Ok::<_, anyhow::Error>(id)
            }
        );

        assert_eq!(answered?, vec!["2".to_string()]);
        assert_eq!(summary.cached, vec!["UserQuery".to_string()]);
        assert_eq!(summary.fetched, vec!["UserQuery".to_string()]);
        assert!(summary.is_success());

        let data = env.read(&*user_query("2")?, &Variables::new())?;
        assert_eq!(data["node"]["name"], json!("Grace"));
        assert_eq!(data["node"]["bestFriend"]["name"], json!("Grace"));
        Ok(())
    }

    #[tokio::test]
    async fn test_force_fetch_sends_cached_queries() -> Result<()> {
        let (env, mut network) = environment(false)?;
        env.handle_query_payload(&user_query("1")?, &Variables::new(), &user_payload("1", "Ada"))?;

        let (summary, answered) = tokio::join!(env.force_fetch(vec![request("1")?]), async {
            network.next_query().await?.resolve(user_payload("1", "Ada L."));
            Ok::<_, anyhow::Error>(())
        });
        answered?;

        assert!(summary.cached.is_empty());
        assert_eq!(summary.fetched.len(), 1);
        let data = env.read(&*user_query("1")?, &Variables::new())?;
        assert_eq!(data["node"]["name"], json!("Ada L."));
        Ok(())
    }

    #[tokio::test]
    async fn test_batched_transport_answers_every_query() -> Result<()> {
        let (env, mut network) = environment(true)?;

        let (summary, answered) = tokio::join!(
            env.run_queries(vec![request("1")?, request("2")?]),
            async {
                for _ in 0..2 {
                    let pending = network.next_query().await?;
                    let ids = pending
                        .request
                        .query
                        .identifying_ids(&pending.request.variables)?
                        .unwrap_or_default();
                    let id = ids.first().cloned().unwrap_or_default();
                    if id == "1" {
                        pending.resolve(user_payload("1", "Ada"));
                    } else {
                        pending.reject(NetworkError::request("unavailable"));
                    }
                }
                Ok::<_, anyhow::Error>(())
            }
        );
        answered?;

        assert_eq!(summary.fetched.len(), 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(
            summary.failed[0].error,
            QueryError::Network(NetworkError::request("unavailable"))
        );
        assert_ok!(env.read(&*user_query("1")?, &Variables::new()));
        assert_err!(env.read(&*user_query("2")?, &Variables::new()));
        Ok(())
    }

    #[tokio::test]
    async fn test_refetch_walks_back_to_the_node() -> Result<()> {
        let (env, mut network) = environment(false)?;
        env.handle_query_payload(&user_query("123")?, &Variables::new(), &user_payload("123", "Ada"))?;

        let address_id = env
            .store()
            .read(|records| records.path("client:1").and_then(|path| path.data_id().map(str::to_string)));
        assert_eq!(address_id.as_deref(), Some("client:1"));

        let fragment = Fragment::new("AddressFragment", "Address", vec![scalar("city")])?;
        let pointer = FragmentPointer::new("client:1", fragment)?;

        let (summary, sent) = tokio::join!(env.refetch(&pointer), async {
            let pending = network.next_query().await?;
            let query = pending.request.query.clone();
            let ids = query.identifying_ids(&pending.request.variables)?;
            pending.resolve(json!({
                "node": {"id": "123", "address": {"city": "Porto"}}
            }));
            Ok::<_, anyhow::Error>((query.name.clone(), ids))
        });
        let (name, ids) = sent?;

        assert_eq!(name, "AddressFragmentRefetch");
        assert_eq!(ids, Some(vec!["123".to_string()]));
        assert!(summary.is_success());

        // Written through the same client record
        let data = env.read(&*user_query("123")?, &Variables::new())?;
        assert_eq!(data["node"]["address"]["city"], json!("Porto"));
        assert_eq!(data["node"]["address"]["__dataID__"], json!("client:1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_refetch_of_unknown_client_record_fails() -> Result<()> {
        let (env, _network) = environment(false)?;
        let fragment = Fragment::new("AddressFragment", "Address", vec![scalar("city")])?;
        let pointer = FragmentPointer::new("client:99", fragment)?;

        let summary = env.refetch(&pointer).await;
        assert_eq!(summary.failed.len(), 1);
        assert!(summary.fetched.is_empty());
        Ok(())
    }
}
