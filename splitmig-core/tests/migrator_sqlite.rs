#![cfg(feature = "sqlite")]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use splitmig_core::blueprint::Blueprint;
use splitmig_core::executor::{RetryPolicy, execute_script};
use splitmig_core::metadata::SqliteCatalog;
use splitmig_core::prelude::*;
use splitmig_core::schema::{ColumnDefinition, IndexDefinition, TableMetadata};
use splitmig_core::test_utils::memory_connection;
use splitmig_core::{
    ArtifactKind, DiffContext, Dialect, EntryState, MigrationError, ProcedureBlueprint,
    SchemaMetadataReader, SqlPair, StaticCatalog,
};

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn make_temp_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let count = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("splitmig_it_{}_{}", nanos, count));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn sqlite_config(root: &Path) -> Config {
    Config {
        database_url: "sqlite::memory:".to_owned(),
        retry_delay: Duration::from_millis(1),
        cache_path: root.join("cache").join("database-metadata.json"),
        root: root.to_path_buf(),
        ..Config::default()
    }
}

const CREATE_BOOKS: &str = r#"
[[table]]
name = "books"

[[table.column]]
name = "title"
type = "string"
length = 200

[[table.column]]
name = "pages"
type = "int"
nullable = true

[[table.index]]
name = "idx_books_title"
columns = ["title"]
"#;

const ADD_ISBN: &str = r#"
[[table]]
name = "books"

[[table.column]]
name = "isbn"
type = "string"
length = 20
nullable = true

[[table.index]]
name = "uq_books_isbn"
kind = "unique"
columns = ["isbn"]
"#;

const SEED_BOOKS: &str = r#"
[[seed]]
table = "books"
rows = [
  { title = "Dune", pages = 412 },
  { title = "Solaris", pages = 204 },
]

[[seed]]
table = "books"
environments = ["production"]
rows = [{ title = "Internal handbook", pages = 12 }]
"#;

const CREATE_AUTHORS: &str = r#"
[[table]]
name = "authors"

[[table.column]]
name = "id"
type = "bigint"
unsigned = true
auto_increment = true
primary = true

[[table.column]]
name = "name"
type = "string"
length = 100
"#;

const CREATE_BOOKS_WITH_AUTHOR: &str = r#"
[[table]]
name = "books"

[[table.column]]
name = "id"
type = "bigint"
unsigned = true
auto_increment = true
primary = true

[[table.column]]
name = "author_id"
type = "bigint"
unsigned = true

[[table.column]]
name = "title"
type = "string"
length = 200

[[table.index]]
name = "idx_books_author_id"
columns = ["author_id"]

[[table.foreign_key]]
columns = ["author_id"]
references = ["id"]
at_table = "authors"
on_delete = "CASCADE"
"#;

async fn count(ctx: &Context, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(ctx.pool()).await.unwrap()
}

#[tokio::test]
async fn file_migrations_apply_report_and_roll_back() {
    let root = make_temp_dir();
    let migrations = root.join("migrations");
    fs::create_dir_all(&migrations).unwrap();
    fs::write(migrations.join("1700000000_create_books.toml"), CREATE_BOOKS).unwrap();
    fs::write(migrations.join("1700000100_add_isbn.toml"), ADD_ISBN).unwrap();

    let mut ctx = Context::connect(sqlite_config(&root)).await.unwrap();
    let registry = Registry::discover(ArtifactKind::Migration, &ctx.config().root).unwrap();
    let migrator = Migrator::migrations(ctx.dialect());

    let report = migrator
        .apply(&mut ctx, &registry, &ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(
        report.applied,
        vec!["1700000000_create_books", "1700000100_add_isbn"]
    );
    sqlx::query("INSERT INTO books (title, pages, isbn) VALUES ('Dune', 412, '978-0441013593')")
        .execute(ctx.pool())
        .await
        .unwrap();
    assert!(root.join("cache").join("database-metadata.json").exists());

    let status = migrator.status(&ctx, &registry, None).await.unwrap();
    assert_eq!((status.applied, status.pending), (2, 0));
    assert_eq!(
        status.items[0].file_path,
        "migrations/1700000000_create_books.toml"
    );

    let rolled = migrator
        .rollback(
            &mut ctx,
            &RollbackOptions {
                limit: Some(1),
                ..RollbackOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rolled.rolled_back, vec!["1700000100_add_isbn"]);
    assert_eq!(
        count(&ctx, "SELECT COUNT(*) FROM pragma_table_info('books') WHERE name = 'isbn'").await,
        0
    );

    let status = migrator.status(&ctx, &registry, None).await.unwrap();
    assert_eq!(status.items[1].state, EntryState::Pending);

    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn edited_file_is_applied_again() {
    let root = make_temp_dir();
    let migrations = root.join("migrations");
    fs::create_dir_all(&migrations).unwrap();
    let file = migrations.join("1700000000_log.toml");
    fs::write(
        &file,
        "[[raw]]\nup = \"CREATE TABLE log_a (id INTEGER)\"\ndown = \"DROP TABLE log_a\"\n",
    )
    .unwrap();

    let mut ctx = Context::connect(sqlite_config(&root)).await.unwrap();
    let migrator = Migrator::migrations(ctx.dialect());
    let registry = Registry::discover(ArtifactKind::Migration, &root).unwrap();
    migrator
        .apply(&mut ctx, &registry, &ApplyOptions::default())
        .await
        .unwrap();

    fs::write(
        &file,
        "[[raw]]\nup = \"CREATE TABLE log_b (id INTEGER)\"\ndown = \"DROP TABLE log_b\"\n",
    )
    .unwrap();
    let registry = Registry::discover(ArtifactKind::Migration, &root).unwrap();
    let report = migrator
        .apply(&mut ctx, &registry, &ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(count(&ctx, "SELECT COUNT(*) FROM _SPLITPHP_MIGRATION").await, 2);

    // Both rows share a path, so status collapses them to one applied item.
    let status = migrator.status(&ctx, &registry, None).await.unwrap();
    assert_eq!(status.items.len(), 1);
    assert_eq!(status.applied, 1);

    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn seed_files_follow_environment_allowlists() {
    let root = make_temp_dir();
    fs::create_dir_all(root.join("migrations")).unwrap();
    fs::create_dir_all(root.join("modules").join("library").join("seeds")).unwrap();
    fs::write(
        root.join("migrations").join("1700000000_create_books.toml"),
        CREATE_BOOKS,
    )
    .unwrap();
    fs::write(
        root.join("modules")
            .join("library")
            .join("seeds")
            .join("1700000500_books.toml"),
        SEED_BOOKS,
    )
    .unwrap();

    let mut ctx = Context::connect(sqlite_config(&root)).await.unwrap();
    let migrations = Registry::discover(ArtifactKind::Migration, &root).unwrap();
    Migrator::migrations(ctx.dialect())
        .apply(&mut ctx, &migrations, &ApplyOptions::default())
        .await
        .unwrap();

    let seeds = Registry::discover(ArtifactKind::Seed, &root).unwrap();
    assert_eq!(seeds.entries()[0].module.as_deref(), Some("library"));
    let seeder = Migrator::seeds(ctx.dialect());
    let report = seeder
        .apply(
            &mut ctx,
            &seeds,
            &ApplyOptions {
                module: Some("library".to_owned()),
                ..ApplyOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(count(&ctx, "SELECT COUNT(*) FROM books").await, 2);

    seeder
        .rollback(&mut ctx, &RollbackOptions::default())
        .await
        .unwrap();
    assert_eq!(count(&ctx, "SELECT COUNT(*) FROM books").await, 0);
    assert_eq!(count(&ctx, "SELECT COUNT(*) FROM _SPLITPHP_SEED").await, 0);

    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn invalid_blueprint_fails_before_any_sql() {
    let root = make_temp_dir();
    let migrations = root.join("migrations");
    fs::create_dir_all(&migrations).unwrap();
    fs::write(
        migrations.join("1700000000_bad.toml"),
        "[[table]]\nname = \"bad\"\n\n[[table.column]]\nname = \"label\"\ntype = \"string\"\nunsigned = true\n",
    )
    .unwrap();

    let mut ctx = Context::connect(sqlite_config(&root)).await.unwrap();
    let registry = Registry::discover(ArtifactKind::Migration, &root).unwrap();
    let err = Migrator::migrations(ctx.dialect())
        .apply(&mut ctx, &registry, &ApplyOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Validation(ref problems) if !problems.is_empty()));
    assert_eq!(
        count(&ctx, "SELECT COUNT(*) FROM sqlite_master WHERE name = 'bad'").await,
        0
    );

    fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn alter_up_then_down_restores_the_catalog() {
    let mut conn = memory_connection().await.unwrap();
    sqlx::raw_sql("CREATE TABLE notes (body TEXT NOT NULL)")
        .execute(&mut conn)
        .await
        .unwrap();
    let mut reader = SchemaMetadataReader::new(SqliteCatalog);
    let before = reader.table_info(&mut conn, "notes", true).await.unwrap();

    let mut table = TableBlueprint::new("notes");
    table.string("author", 80).nullable();
    table.index("idx_notes_author", IndexKind::Index, ["author"]);
    let blueprint = Blueprint::from(table);
    let ctx = DiffContext::new(Dialect::Sqlite, "dev");

    let pair = blueprint
        .obtain_sql(&mut reader, &mut conn, &ctx)
        .await
        .unwrap()
        .unwrap();
    execute_script(&mut conn, &pair.up, RetryPolicy::no_retry())
        .await
        .unwrap();
    let during = reader.table_info(&mut conn, "notes", true).await.unwrap();
    assert!(during.as_ref().and_then(|t| t.column("author")).is_some());

    execute_script(&mut conn, &pair.down, RetryPolicy::no_retry())
        .await
        .unwrap();
    let after = reader.table_info(&mut conn, "notes", true).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn keyed_file_migrations_apply_and_roll_back() {
    let root = make_temp_dir();
    let migrations = root.join("migrations");
    fs::create_dir_all(&migrations).unwrap();
    fs::write(migrations.join("1700000000_create_authors.toml"), CREATE_AUTHORS).unwrap();
    fs::write(
        migrations.join("1700000100_create_books.toml"),
        CREATE_BOOKS_WITH_AUTHOR,
    )
    .unwrap();

    let mut ctx = Context::connect(sqlite_config(&root)).await.unwrap();
    let registry = Registry::discover(ArtifactKind::Migration, &root).unwrap();
    let migrator = Migrator::migrations(ctx.dialect());
    let report = migrator
        .apply(&mut ctx, &registry, &ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(report.applied.len(), 2);

    sqlx::raw_sql(
        "INSERT INTO authors (name) VALUES ('Le Guin');\n\
         INSERT INTO authors (name) VALUES ('Lem');\n\
         INSERT INTO books (author_id, title) VALUES (2, 'Solaris');",
    )
    .execute(ctx.pool())
    .await
    .unwrap();
    let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM authors ORDER BY id")
        .fetch_all(ctx.pool())
        .await
        .unwrap();
    assert_eq!(ids, vec![1, 2]);

    let orphan = sqlx::query("INSERT INTO books (author_id, title) VALUES (99, 'Nobody')")
        .execute(ctx.pool())
        .await;
    assert!(orphan.is_err());
    sqlx::query("DELETE FROM authors WHERE id = 2")
        .execute(ctx.pool())
        .await
        .unwrap();
    assert_eq!(count(&ctx, "SELECT COUNT(*) FROM books").await, 0);

    let rolled = migrator
        .rollback(&mut ctx, &RollbackOptions::default())
        .await
        .unwrap();
    assert_eq!(
        rolled.rolled_back,
        vec!["1700000100_create_books", "1700000000_create_authors"]
    );
    assert_eq!(
        count(
            &ctx,
            "SELECT COUNT(*) FROM sqlite_master WHERE name IN ('authors', 'books')"
        )
        .await,
        0
    );

    fs::remove_dir_all(&root).unwrap();
}

async fn run_blueprint(
    reader: &mut SchemaMetadataReader<SqliteCatalog>,
    conn: &mut sqlx::AnyConnection,
    table: TableBlueprint,
) -> SqlPair {
    let ctx = DiffContext::new(Dialect::Sqlite, "dev");
    let pair = Blueprint::from(table)
        .obtain_sql(reader, conn, &ctx)
        .await
        .unwrap()
        .unwrap();
    execute_script(conn, &pair.up, RetryPolicy::no_retry())
        .await
        .unwrap();
    pair
}

fn authors() -> TableBlueprint {
    TableBlueprint::define("authors", |t| {
        t.id("id");
        t.string("name", 100);
    })
    .unwrap()
}

fn books() -> TableBlueprint {
    TableBlueprint::define("books", |t| {
        t.id("id");
        t.bigint("author_id").unsigned();
        t.string("title", 200);
        t.index("idx_books_author_id", IndexKind::Index, ["author_id"]);
        t.foreign(["author_id"])
            .references(["id"])
            .at_table("authors")
            .on_delete(ReferentialAction::Cascade);
    })
    .unwrap()
}

#[tokio::test]
async fn keyed_tables_round_trip_through_the_sqlite_catalog() {
    let mut conn = memory_connection().await.unwrap();
    let mut reader = SchemaMetadataReader::new(SqliteCatalog);
    let ctx = DiffContext::new(Dialect::Sqlite, "dev");

    let authors_pair = run_blueprint(&mut reader, &mut conn, authors()).await;
    let books_pair = run_blueprint(&mut reader, &mut conn, books()).await;

    let created = reader
        .table_info(&mut conn, "books", true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        created.primary_key().map(|p| p.columns.clone()),
        Some(vec!["id".to_owned()])
    );
    assert!(created.column("id").is_some_and(|c| c.auto_increment));
    assert_eq!(created.foreign_keys.len(), 1);
    assert_eq!(created.foreign_keys[0].name, "fk_books_author_id");
    assert_eq!(created.foreign_keys[0].on_delete, ReferentialAction::Cascade);

    for table in [authors(), books()] {
        let again = Blueprint::from(table)
            .obtain_sql(&mut reader, &mut conn, &ctx)
            .await
            .unwrap()
            .unwrap();
        assert!(again.is_empty(), "{again:?}");
    }

    let mut drop_books = TableBlueprint::new("books");
    drop_books.drop_table();
    let dropped = run_blueprint(&mut reader, &mut conn, drop_books).await;
    assert!(reader.table_info(&mut conn, "books", true).await.unwrap().is_none());
    execute_script(&mut conn, &dropped.down, RetryPolicy::no_retry())
        .await
        .unwrap();
    let restored = reader.table_info(&mut conn, "books", true).await.unwrap();
    assert_eq!(restored.as_ref(), Some(&created));

    for pair in [&books_pair, &authors_pair] {
        execute_script(&mut conn, &pair.down, RetryPolicy::no_retry())
            .await
            .unwrap();
    }
    let tables = reader.list_tables(&mut conn).await.unwrap();
    assert!(!tables.iter().any(|t| t == "authors" || t == "books"), "{tables:?}");
}

#[tokio::test]
async fn sqlite_rejects_key_changes_on_existing_tables() {
    let mut conn = memory_connection().await.unwrap();
    let mut reader = SchemaMetadataReader::new(SqliteCatalog);
    let ctx = DiffContext::new(Dialect::Sqlite, "dev");
    run_blueprint(&mut reader, &mut conn, authors()).await;

    let mut mentor = TableBlueprint::new("authors");
    mentor.bigint("mentor_id").unsigned().nullable();
    mentor.foreign(["mentor_id"]).references(["id"]).at_table("authors");
    let err = Blueprint::from(mentor)
        .obtain_sql(&mut reader, &mut conn, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Validation(ref e) if e.len() == 1), "{err}");

    let mut rename = TableBlueprint::new("authors");
    rename.string("name", 40);
    let err = Blueprint::from(rename)
        .obtain_sql(&mut reader, &mut conn, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Validation(_)), "{err}");

    let mut procedure = ProcedureBlueprint::new("touch_author");
    procedure.body("UPDATE authors SET name = name");
    let err = Blueprint::from(procedure)
        .obtain_sql(&mut reader, &mut conn, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Validation(_)), "{err}");

    let unchanged = reader.table_info(&mut conn, "authors", true).await.unwrap();
    assert_eq!(unchanged.map(|t| t.columns.len()), Some(2));
}

#[tokio::test]
async fn mysql_create_plan_over_static_catalog() {
    let mut conn = memory_connection().await.unwrap();
    let mut existing = TableMetadata::new("accounts");
    existing.columns = vec![ColumnDefinition::new("id", ColumnType::Bigint)];
    existing.indexes = vec![IndexDefinition::new(
        IndexDefinition::PRIMARY,
        IndexKind::Primary,
        vec!["id".to_owned()],
    )];
    let mut reader = SchemaMetadataReader::new(StaticCatalog::new().with_table(existing));
    let ctx = DiffContext::new(Dialect::MySql, "dev");

    let users = TableBlueprint::define("users", |t| {
        t.id("id");
        t.string("name", 255);
        t.index("idx_users_name", IndexKind::Index, ["name"]);
    })
    .unwrap();
    let pair = Blueprint::from(users)
        .obtain_sql(&mut reader, &mut conn, &ctx)
        .await
        .unwrap()
        .unwrap();

    let create = pair.up.find("CREATE TABLE `users`").unwrap();
    let index = pair.up.find("ADD INDEX `idx_users_name`").unwrap();
    let auto = pair.up.find("AUTO_INCREMENT").unwrap();
    assert!(create < index && index < auto);
    assert_eq!(pair.down, "DROP TABLE `users`;");

    let mut denied = SchemaMetadataReader::new(StaticCatalog::new().deny("COLUMNS"));
    let err = denied
        .table_info(&mut conn, "accounts", false)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::CatalogAccess { ref view, .. } if view == "COLUMNS"));
}
