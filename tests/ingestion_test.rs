use northwind_loader::config::{
    Catalog, ColumnTypes, DatasetEntry, Destination, RepairRule, NAMESPACE_PREFIX,
};
use northwind_loader::error::IngestError;
use northwind_loader::ingestion::{EntryState, Fetcher, IngestionOrchestrator, TableBuilder};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serve `routes` (path without leading slash -> body) over HTTP; anything
/// else is a 404. Returns the base URL.
async fn serve(routes: HashMap<String, Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let path = request
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("/")
                    .trim_start_matches('/')
                    .to_string();

                let response = match routes.get(&path) {
                    Some(body) => {
                        let mut response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/csv\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        )
                        .into_bytes();
                        response.extend_from_slice(body);
                        response
                    }
                    None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_vec(),
                };
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}/", addr)
}

fn orchestrator(base: &str) -> IngestionOrchestrator {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    IngestionOrchestrator::new(Arc::new(Fetcher::with_client(client)), base)
}

fn write_fixture(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).unwrap();
}

fn strings(target: &TableBuilder, sql: &str) -> Vec<Vec<Option<String>>> {
    let conn = target.connection();
    let mut stmt = conn.prepare(sql).unwrap();
    let width = sql.matches("CAST(").count();
    stmt.query_map([], |row| {
        (0..width)
            .map(|i| row.get::<_, Option<String>>(i))
            .collect::<Result<Vec<_>, _>>()
    })
    .unwrap()
    .map(|r| r.unwrap())
    .collect()
}

const CUSTOMERS: &str = "\
customerID,companyName,city,fax
ALFKI,Alfreds Futterkiste,Berlin,030-0076545
ANATR,\"Ana Trujillo Emparedados y helados\",\"México D.F.\",\"(5) 555,3745\"
BOLID,\"Bólido Comidas preparadas, S.L.\",Madrid,\"(91) 555 ,91 99\"
";

const SHIPPERS: &str = "\
shipperID,companyName,phone
1,Speedy Express,(503) 555-9831
2,United Package,(503) 555-3199
3,Federal Shipping,(503) 555-9931
";

#[tokio::test]
async fn test_fax_scenario_loads_repaired_values() {
    let dir = TempDir::new().unwrap();
    write_fixture(dir.path(), "contacts.csv", "id,fax\n1,\"555,1234\"\n2,5559999\n");

    let catalog = Catalog::new(vec![DatasetEntry::new("contacts", "contacts.csv")
        .with_repair(RepairRule::columns(["fax"]))]);
    let mut target = TableBuilder::open(&Destination::InMemory).unwrap();
    let summary = orchestrator(dir.path().to_str().unwrap())
        .run(&catalog, &mut target)
        .await
        .unwrap();

    let outcome = summary.outcome("contacts").unwrap();
    assert_eq!(outcome.state, EntryState::Loaded);
    assert_eq!(outcome.rows_loaded, Some(2));
    assert_eq!(outcome.skipped_rows(), 0);

    let rows = strings(
        &target,
        "SELECT CAST(id AS VARCHAR), CAST(fax AS VARCHAR) FROM nw_contacts ORDER BY id",
    );
    assert_eq!(
        rows,
        vec![
            vec![Some("1".to_string()), Some("5551234".to_string())],
            vec![Some("2".to_string()), Some("5559999".to_string())],
        ]
    );
}

#[tokio::test]
async fn test_repair_is_scoped_to_configured_columns() {
    let dir = TempDir::new().unwrap();
    write_fixture(dir.path(), "customers.csv", CUSTOMERS);

    let all_text = ColumnTypes::new([
        ("customerID", "VARCHAR"),
        ("companyName", "VARCHAR"),
        ("city", "VARCHAR"),
        ("fax", "VARCHAR"),
    ]);
    let catalog = Catalog::new(vec![DatasetEntry::new("customers", "customers.csv")
        .with_repair(RepairRule::columns(["fax"]))
        .with_column_types(all_text)]);
    let mut target = TableBuilder::open(&Destination::InMemory).unwrap();
    orchestrator(dir.path().to_str().unwrap())
        .run(&catalog, &mut target)
        .await
        .unwrap();

    let rows = strings(
        &target,
        "SELECT CAST(companyName AS VARCHAR), CAST(fax AS VARCHAR) FROM nw_customers ORDER BY customerID",
    );
    for row in &rows {
        assert!(!row[1].as_deref().unwrap_or("").contains(','));
    }
    // untouched column keeps its comma
    assert_eq!(rows[2][0].as_deref(), Some("Bólido Comidas preparadas, S.L."));
    assert_eq!(rows[1][1].as_deref(), Some("(5) 5553745"));
    assert_eq!(rows[2][1].as_deref(), Some("(91) 555 91 99"));

    let columns: Vec<String> = target
        .columns("nw_customers")
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(columns, vec!["customerID", "companyName", "city", "fax"]);
}

#[tokio::test]
async fn test_malformed_rows_are_skipped_and_counted() {
    let dir = TempDir::new().unwrap();
    write_fixture(
        dir.path(),
        "shippers.csv",
        "shipperID,companyName,phone\n1,Speedy,555\n2,Broken\n3,Federal,556\n4\n",
    );

    let catalog = Catalog::new(vec![DatasetEntry::new("shippers", "shippers.csv")]);
    let mut target = TableBuilder::open(&Destination::InMemory).unwrap();
    let summary = orchestrator(dir.path().to_str().unwrap())
        .run(&catalog, &mut target)
        .await
        .unwrap();

    let outcome = summary.outcome("shippers").unwrap();
    assert_eq!(outcome.state, EntryState::Loaded);
    assert_eq!(outcome.skipped_rows(), 2);
    assert_eq!(outcome.rows_loaded, Some(4 - 2));
    assert_eq!(target.row_count("nw_shippers").unwrap(), 2);
    assert!(!summary.has_failures());
    assert_eq!(summary.exit_code(), 0);
}

#[tokio::test]
async fn test_http_404_fails_one_dataset_only() {
    let mut routes = HashMap::new();
    routes.insert("customers.csv".to_string(), CUSTOMERS.as_bytes().to_vec());
    routes.insert("shippers.csv".to_string(), SHIPPERS.as_bytes().to_vec());
    let base = serve(routes).await;

    let catalog = Catalog::new(vec![
        DatasetEntry::new("customers", "customers.csv").with_repair(RepairRule::columns(["fax"])),
        DatasetEntry::new("orders", "orders.csv"),
        DatasetEntry::new("shippers", "shippers.csv"),
    ]);
    let mut target = TableBuilder::open(&Destination::InMemory).unwrap();
    let summary = orchestrator(&base).run(&catalog, &mut target).await.unwrap();

    assert!(summary.has_failures());
    assert_eq!(summary.exit_code(), 1);
    let failed: Vec<_> = summary.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "orders");
    assert_eq!(failed[0].failed_after, Some(EntryState::Pending));
    assert!(matches!(
        failed[0].error,
        Some(IngestError::ResourceUnavailable { .. })
    ));

    assert_eq!(target.row_count("nw_customers").unwrap(), 3);
    assert_eq!(target.row_count("nw_shippers").unwrap(), 3);
    assert_eq!(summary.tables, vec!["nw_customers", "nw_shippers"]);

    let rendered = summary.to_string();
    assert!(rendered.contains("ResourceUnavailable"));
    assert!(rendered.contains("2 of 3 datasets loaded, 1 failed"));
}

#[tokio::test]
async fn test_non_utf8_body_is_unavailable() {
    let mut routes = HashMap::new();
    routes.insert("latin1.csv".to_string(), b"id,name\n1,caf\xe9\n".to_vec());
    routes.insert("shippers.csv".to_string(), SHIPPERS.as_bytes().to_vec());
    let base = serve(routes).await;

    let catalog = Catalog::new(vec![
        DatasetEntry::new("latin1", "latin1.csv"),
        DatasetEntry::new("shippers", "shippers.csv"),
    ]);
    let mut target = TableBuilder::open(&Destination::InMemory).unwrap();
    let summary = orchestrator(&base).run(&catalog, &mut target).await.unwrap();

    let latin1 = summary.outcome("latin1").unwrap();
    assert_eq!(latin1.state, EntryState::Failed);
    assert_eq!(latin1.failed_after, Some(EntryState::Pending));
    assert!(matches!(
        latin1.error,
        Some(IngestError::ResourceUnavailable { .. })
    ));
    assert!(summary.outcome("shippers").unwrap().is_loaded());
    assert_eq!(summary.tables, vec!["nw_shippers"]);
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test]
async fn test_load_failure_does_not_stop_siblings() {
    let dir = TempDir::new().unwrap();
    write_fixture(dir.path(), "shippers.csv", SHIPPERS);
    write_fixture(dir.path(), "dates.csv", "id,at\n1,not a date\n");

    let catalog = Catalog::new(vec![
        DatasetEntry::new("dates", "dates.csv")
            .with_column_types(ColumnTypes::new([("id", "INTEGER"), ("at", "DATE")])),
        DatasetEntry::new("shippers", "shippers.csv"),
    ]);
    let mut target = TableBuilder::open(&Destination::InMemory).unwrap();
    let summary = orchestrator(dir.path().to_str().unwrap())
        .run(&catalog, &mut target)
        .await
        .unwrap();

    let dates = summary.outcome("dates").unwrap();
    assert_eq!(dates.state, EntryState::Failed);
    assert_eq!(dates.failed_after, Some(EntryState::Cleaned));
    match &dates.error {
        Some(IngestError::LoadFailed { table, .. }) => assert_eq!(table, "nw_dates"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(summary.outcome("shippers").unwrap().is_loaded());
    assert_eq!(summary.tables, vec!["nw_shippers"]);
}

#[tokio::test]
async fn test_rerun_against_file_database_is_idempotent() {
    let dir = TempDir::new().unwrap();
    write_fixture(dir.path(), "customers.csv", CUSTOMERS);
    write_fixture(dir.path(), "shippers.csv", SHIPPERS);
    let db_path = dir.path().join("northwind.duckdb");

    let catalog = Catalog::new(vec![
        DatasetEntry::new("customers", "customers.csv").with_repair(RepairRule::columns(["fax"])),
        DatasetEntry::new("shippers", "shippers.csv"),
    ]);
    let base = dir.path().to_str().unwrap().to_string();

    let mut snapshots = Vec::new();
    for _ in 0..2 {
        let mut target = TableBuilder::open(&Destination::File(db_path.clone())).unwrap();
        let summary = orchestrator(&base).run(&catalog, &mut target).await.unwrap();
        assert!(!summary.has_failures());

        let mut snapshot = Vec::new();
        for table in target.list_tables(NAMESPACE_PREFIX).unwrap() {
            snapshot.push((
                table.clone(),
                target.row_count(&table).unwrap(),
                target.columns(&table).unwrap(),
            ));
        }
        snapshots.push(snapshot);
    }

    assert!(db_path.exists());
    assert_eq!(snapshots[0], snapshots[1]);
    assert_eq!(snapshots[0].len(), 2);
}

#[tokio::test]
async fn test_in_memory_destination_writes_no_files() {
    let dir = TempDir::new().unwrap();
    write_fixture(dir.path(), "shippers.csv", SHIPPERS);

    let catalog = Catalog::new(vec![DatasetEntry::new("shippers", "shippers.csv")]);
    let staging = TempDir::new().unwrap();
    let mut target = TableBuilder::open(&Destination::InMemory)
        .unwrap()
        .with_staging_dir(staging.path());
    let summary = orchestrator(dir.path().to_str().unwrap())
        .run(&catalog, &mut target)
        .await
        .unwrap();
    assert_eq!(summary.destination, ":memory:");
    assert!(summary.outcome("shippers").unwrap().is_loaded());
    drop(target);

    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("shippers.csv")]);
    // staged CSV copies are removed once each table is built
    assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_run_future_is_send() {
    let dir = TempDir::new().unwrap();
    write_fixture(dir.path(), "shippers.csv", SHIPPERS);
    let orchestrator = orchestrator(dir.path().to_str().unwrap());

    // spawning requires the whole run, logging spans included, to be Send
    let handle = tokio::spawn(async move {
        let catalog = Catalog::new(vec![DatasetEntry::new("shippers", "shippers.csv")]);
        let mut target = TableBuilder::open(&Destination::InMemory).unwrap();
        let summary = orchestrator.run(&catalog, &mut target).await.unwrap();
        (summary.exit_code(), target.row_count("nw_shippers").unwrap())
    });

    let (exit_code, rows) = handle.await.unwrap();
    assert_eq!(exit_code, 0);
    assert_eq!(rows, 3);
}

#[tokio::test]
async fn test_unopenable_file_falls_back_to_memory() {
    let dir = TempDir::new().unwrap();
    let bad = Destination::File(dir.path().join("no/such/dir/nw.duckdb"));

    let target = TableBuilder::open_with_fallback(&bad).unwrap();
    assert_eq!(target.destination(), &Destination::InMemory);
    assert!(target.fallback_reason().is_some());
}

#[tokio::test]
async fn test_every_table_carries_namespace_prefix() {
    let dir = TempDir::new().unwrap();
    write_fixture(dir.path(), "order-details.csv", "orderID,productID,quantity\n10248,11,12\n");
    write_fixture(dir.path(), "shippers.csv", SHIPPERS);

    let catalog = Catalog::new(vec![
        DatasetEntry::new("order-details", "order-details.csv"),
        DatasetEntry::new("shippers", "shippers.csv"),
    ]);
    let mut target = TableBuilder::open(&Destination::InMemory).unwrap();
    let summary = orchestrator(dir.path().to_str().unwrap())
        .run(&catalog, &mut target)
        .await
        .unwrap();

    assert_eq!(summary.tables, vec!["nw_order_details", "nw_shippers"]);
    for outcome in &summary.outcomes {
        assert!(outcome.table.starts_with(NAMESPACE_PREFIX));
    }
}
