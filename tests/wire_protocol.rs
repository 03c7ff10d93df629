use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use venue_ledger::engine::Engine;
use venue_ledger::model::VenueId;
use venue_ledger::notify::NotifyHub;
use venue_ledger::wire;

const PASSWORD: &str = "ledger";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("venue_ledger_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("ledger.wal"), Arc::new(NotifyHub::new())).unwrap());

    let server_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = server_engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("ledger")
        .user("planner")
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn insert_sql(id: Ulid, venue: &str, start: &str, end: &str) -> String {
    format!(r#"INSERT INTO blocks (id, venue_id, start, "end") VALUES ('{id}', '{venue}', '{start}', '{end}')"#)
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn insert_and_list_blocks() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    let later = Ulid::new();
    let earlier = Ulid::new();
    client
        .batch_execute(&insert_sql(later, "lakeside", "2026-02-16", "2026-02-20"))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            r#"INSERT INTO blocks (id, venue_id, start, "end", label) VALUES ('{earlier}', 'lakeside', '2026-02-10', '2026-02-15', 'Nguyen wedding')"#
        ))
        .await
        .unwrap();

    let listed = rows(&client, "SELECT * FROM blocks WHERE venue_id = 'lakeside'").await;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].get("id"), Some(earlier.to_string().as_str()));
    assert_eq!(listed[0].get("start"), Some("2026-02-10"));
    assert_eq!(listed[0].get("end"), Some("2026-02-15"));
    assert_eq!(listed[0].get("label"), Some("Nguyen wedding"));
    assert_eq!(listed[1].get("id"), Some(later.to_string().as_str()));
    assert_eq!(listed[1].get("label"), None);

    let one = rows(&client, &format!("SELECT * FROM blocks WHERE id = '{later}'")).await;
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].get("venue_id"), Some("lakeside"));
}

#[tokio::test]
async fn boundary_day_conflict_is_exclusion_violation() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(&insert_sql(Ulid::new(), "lakeside", "2026-02-10", "2026-02-15"))
        .await
        .unwrap();

    let code = sqlstate(&client, &insert_sql(Ulid::new(), "lakeside", "2026-02-15", "2026-02-20")).await;
    assert_eq!(code, "23P01");
    assert_eq!(engine.list_for_venue(&VenueId::from("lakeside")).await.len(), 1);
}

#[tokio::test]
async fn invalid_input_maps_to_sqlstate() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;

    let reversed = sqlstate(&client, &insert_sql(Ulid::new(), "lakeside", "2026-02-20", "2026-02-10")).await;
    assert_eq!(reversed, "22023");

    let bad_date = sqlstate(&client, &insert_sql(Ulid::new(), "lakeside", "2026-02-31", "2026-03-02")).await;
    assert_eq!(bad_date, "22007");

    let missing = sqlstate(&client, &format!("DELETE FROM blocks WHERE id = '{}'", Ulid::new())).await;
    assert_eq!(missing, "02000");

    let garbage = sqlstate(&client, "BLOCK THE BARN").await;
    assert_eq!(garbage, "42601");

    assert!(engine.venue_ids().is_empty());
}

#[tokio::test]
async fn conflicts_and_availability_queries() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(&insert_sql(Ulid::new(), "lakeside", "2026-02-10", "2026-02-15"))
        .await
        .unwrap();
    client
        .batch_execute(&insert_sql(Ulid::new(), "lakeside", "2026-02-16", "2026-02-20"))
        .await
        .unwrap();

    let conflicts = rows(
        &client,
        r#"SELECT * FROM conflicts WHERE venue_id = 'lakeside' AND start >= '2026-02-12' AND "end" <= '2026-02-13'"#,
    )
    .await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].get("start"), Some("2026-02-10"));

    let clear = rows(
        &client,
        r#"SELECT * FROM conflicts WHERE venue_id = 'lakeside' AND start >= '2026-02-21' AND "end" <= '2026-02-28'"#,
    )
    .await;
    assert!(clear.is_empty());

    let free = rows(
        &client,
        r#"SELECT * FROM availability WHERE venue_id = 'lakeside' AND start >= '2026-02-01' AND "end" <= '2026-02-28'"#,
    )
    .await;
    let spans: Vec<_> = free
        .iter()
        .map(|r| (r.get("start").unwrap().to_string(), r.get("end").unwrap().to_string()))
        .collect();
    assert_eq!(
        spans,
        vec![
            ("2026-02-01".to_string(), "2026-02-09".to_string()),
            ("2026-02-21".to_string(), "2026-02-28".to_string()),
        ]
    );
    assert_eq!(free[1].get("days"), Some("8"));

    let long = rows(
        &client,
        r#"SELECT * FROM availability WHERE venue_id = 'lakeside' AND start >= '2026-02-01' AND "end" <= '2026-02-28' AND min_days = 9"#,
    )
    .await;
    assert_eq!(long.len(), 1);
    assert_eq!(long[0].get("start"), Some("2026-02-01"));
}

#[tokio::test]
async fn multi_row_insert_is_atomic() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(&insert_sql(Ulid::new(), "barn", "2026-05-05", "2026-05-06"))
        .await
        .unwrap();

    let code = sqlstate(
        &client,
        &format!(
            r#"INSERT INTO blocks (id, venue_id, start, "end") VALUES ('{}', 'chapel', '2026-05-01', '2026-05-02'), ('{}', 'barn', '2026-05-06', '2026-05-07')"#,
            Ulid::new(),
            Ulid::new()
        ),
    )
    .await;
    assert_eq!(code, "23P01");
    assert!(engine.list_for_venue(&VenueId::from("chapel")).await.is_empty());
}

#[tokio::test]
async fn unknown_venue_has_no_rows() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    assert!(rows(&client, "SELECT * FROM blocks WHERE venue_id = 'unknown-venue'").await.is_empty());
    let free = rows(
        &client,
        r#"SELECT * FROM availability WHERE venue_id = 'unknown-venue' AND start >= '2026-02-01' AND "end" <= '2026-02-28'"#,
    )
    .await;
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].get("days"), Some("28"));
}

#[tokio::test]
async fn extended_protocol_parameters() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;

    let id = Ulid::new().to_string();
    let inserted = client
        .execute(
            r#"INSERT INTO blocks (id, venue_id, start, "end", label) VALUES ($1, $2, $3, $4, $5)"#,
            &[&id, &"orchard", &"2026-09-12", &"2026-09-13", &"O'Connor rehearsal, $2 deposit"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let listed = client
        .query("SELECT * FROM blocks WHERE venue_id = $1", &[&"orchard"])
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    let label: Option<&str> = listed[0].get("label");
    assert_eq!(label, Some("O'Connor rehearsal, $2 deposit"));
    assert_eq!(engine.list_for_venue(&VenueId::from("orchard")).await.len(), 1);
}

#[tokio::test]
async fn state_survives_server_restart() {
    let dir = std::env::temp_dir().join(format!("venue_ledger_int_restart_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let wal = dir.join("ledger.wal");
    let id = Ulid::new();
    {
        let engine = Engine::new(wal.clone(), Arc::new(NotifyHub::new())).unwrap();
        let handler_engine = Arc::new(engine);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_engine = handler_engine.clone();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ = wire::process_connection(socket, server_engine, PASSWORD.to_string(), None).await;
        });
        let client = connect(addr).await;
        client
            .batch_execute(&insert_sql(id, "vineyard", "2026-07-04", "2026-07-05"))
            .await
            .unwrap();
        drop(client);
        let _ = server.await;
    }

    let engine = Engine::new(wal, Arc::new(NotifyHub::new())).unwrap();
    let blocks = engine.list_for_venue(&VenueId::from("vineyard")).await;
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].id, id);
}
