use std::fs;
use std::sync::Arc;

use anyhow::Context as _;
use colored::Colorize;
use serde::Serialize;
use strata_context::{CommitSummary, DataDomain, DomainConfig};
use strata_flush::EntitySorter;
use strata_map::{EntityResolver, PropertyKind};
use strata_store::InMemoryDatabase;
use tracing::info;

use crate::cli::*;

const DEMO_MAPPING: &str = include_str!("../../../fixtures/gallery.toml");

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Check(args) => cmd_check(args, &cli.format),
        Command::Order(args) => cmd_order(args, &cli.format),
        Command::Config(args) => cmd_config(args),
        Command::Demo(args) => cmd_demo(args, &cli.format),
    }
}

fn load_mapping(path: &str) -> anyhow::Result<EntityResolver> {
    let text = fs::read_to_string(path).with_context(|| format!("cannot read {path}"))?;
    EntityResolver::from_toml_str(&text).with_context(|| format!("invalid mapping {path}"))
}

fn load_config(path: Option<&str>) -> anyhow::Result<DomainConfig> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("cannot read {path}"))?;
            Ok(DomainConfig::from_toml_str(&text)?)
        }
        None => Ok(DomainConfig::default()),
    }
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct MappingReport {
    pub tables: usize,
    pub entities: Vec<EntityReport>,
}

#[derive(Debug, Serialize)]
pub struct EntityReport {
    pub name: String,
    pub table: String,
    pub attributes: usize,
    pub optimistic: bool,
    pub read_only: bool,
    pub relationships: Vec<RelationshipReport>,
}

#[derive(Debug, Serialize)]
pub struct RelationshipReport {
    pub name: String,
    pub target: String,
    pub kind: &'static str,
    pub delete_rule: String,
}

pub fn mapping_report(resolver: &EntityResolver) -> anyhow::Result<MappingReport> {
    let mut entities = Vec::new();
    for entity in resolver.obj_entities() {
        let descriptor = resolver.class_descriptor(&entity.name)?;
        let relationships = entity
            .relationships
            .iter()
            .map(|rel| RelationshipReport {
                name: rel.name.clone(),
                target: rel.target.clone(),
                kind: match descriptor.property_kind(&rel.name) {
                    Some(PropertyKind::ToOne) => "to-one",
                    Some(PropertyKind::Flattened) => "flattened",
                    _ => "to-many",
                },
                delete_rule: rel.delete_rule.to_string(),
            })
            .collect();
        entities.push(EntityReport {
            name: entity.name.clone(),
            table: entity.db_entity.clone(),
            attributes: entity.attributes.len(),
            optimistic: entity.is_optimistic(),
            read_only: entity.read_only,
            relationships,
        });
    }
    entities.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(MappingReport {
        tables: resolver.db_entities().count(),
        entities,
    })
}

fn cmd_check(args: CheckArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let resolver = load_mapping(&args.mapping)?;
    let report = mapping_report(&resolver)?;
    if let OutputFormat::Json = format {
        return print_json(&report);
    }
    println!(
        "{} {} is valid: {} entities over {} tables",
        "✓".green().bold(),
        args.mapping.bold(),
        report.entities.len(),
        report.tables
    );
    for entity in &report.entities {
        let mut flags = Vec::new();
        if entity.optimistic {
            flags.push("optimistic");
        }
        if entity.read_only {
            flags.push("read-only");
        }
        let flags = if flags.is_empty() { String::new() } else { format!(" [{}]", flags.join(", ")) };
        println!(
            "  {} → {} ({} attributes){}",
            entity.name.cyan().bold(),
            entity.table,
            entity.attributes,
            flags.yellow()
        );
        for rel in &entity.relationships {
            println!(
                "    {} → {} {} {}",
                rel.name,
                rel.target.cyan(),
                rel.kind.dimmed(),
                rel.delete_rule.dimmed()
            );
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// order
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct OrderReport<'a> {
    insert_order: &'a [String],
    self_referencing: Vec<&'a str>,
}

fn cmd_order(args: OrderArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let resolver = load_mapping(&args.mapping)?;
    let sorter = EntitySorter::new(&resolver);
    let order = sorter.table_order();
    if let OutputFormat::Json = format {
        return print_json(&OrderReport {
            insert_order: order,
            self_referencing: order
                .iter()
                .filter(|t| sorter.is_reflexive(t))
                .map(String::as_str)
                .collect(),
        });
    }
    println!("Inserts and updates run top to bottom, deletes bottom to top:");
    for (i, table) in order.iter().enumerate() {
        let note = if sorter.is_reflexive(table) { " (self-referencing)".yellow().to_string() } else { String::new() };
        println!("  {:>3}. {}{}", i + 1, table.bold(), note);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(args.path.as_deref())?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// demo
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct DemoStep {
    pub name: &'static str,
    pub summary: CommitSummary,
    pub statements: Vec<String>,
}

/// Insert an artist with paintings, reprice one painting from a child
/// context, then delete the artist and let the cascade remove the rest.
pub fn run_demo(config: DomainConfig) -> anyhow::Result<Vec<DemoStep>> {
    let resolver = Arc::new(EntityResolver::from_toml_str(DEMO_MAPPING)?);
    let db = Arc::new(InMemoryDatabase::new(&resolver));
    let domain = Arc::new(DataDomain::new(resolver, db.clone(), config));
    let ctx = domain.create_context();
    let mut steps = Vec::new();

    let artist = ctx.new_object("Artist")?;
    ctx.write_property(&artist.id(), "artistName", "Claude Monet")?;
    ctx.write_property(&artist.id(), "biography", "Founder of French Impressionism")?;
    let gallery = ctx.new_object("Gallery")?;
    ctx.write_property(&gallery.id(), "galleryId", 1)?;
    ctx.write_property(&gallery.id(), "galleryName", "Musée d'Orsay")?;
    let mut paintings = Vec::new();
    for (title, price) in [("Water Lilies", 1200), ("Poppies", 900)] {
        let painting = ctx.new_object("Painting")?;
        let id = painting.id();
        ctx.write_property(&id, "paintingTitle", title)?;
        ctx.write_property(&id, "estimatedPrice", price)?;
        ctx.set_to_one(&id, "toArtist", Some(&artist.id()))?;
        ctx.set_to_one(&id, "toGallery", Some(&gallery.id()))?;
        paintings.push(painting);
    }
    steps.push(record(&db, "insert", ctx.commit_changes()?)?);

    let child = ctx.create_child();
    let repriced = paintings[0].id();
    child.local_object(&repriced)?;
    child.write_property(&repriced, "estimatedPrice", 1500)?;
    child.commit_changes_to_parent()?;
    steps.push(record(&db, "update from child context", ctx.commit_changes()?)?);

    ctx.delete_objects(&[artist.id()])?;
    steps.push(record(&db, "cascade delete", ctx.commit_changes()?)?);

    info!(steps = steps.len(), "demo finished");
    Ok(steps)
}

fn record(db: &InMemoryDatabase, name: &'static str, summary: CommitSummary) -> anyhow::Result<DemoStep> {
    let statements = db
        .statements()?
        .iter()
        .map(|s| format!("{} {} ({} rows)", s.kind, s.table, s.rows))
        .collect();
    db.clear_statements()?;
    Ok(DemoStep { name, summary, statements })
}

fn cmd_demo(args: DemoArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let steps = run_demo(config)?;
    if let OutputFormat::Json = format {
        return print_json(&steps);
    }
    for step in &steps {
        println!(
            "{} {}: {} inserted, {} updated, {} deleted",
            "✓".green().bold(),
            step.name.bold(),
            step.summary.inserted,
            step.summary.updated,
            step.summary.deleted
        );
        for statement in &step.statements {
            println!("    {}", statement.dimmed());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLES: &str = include_str!("../../../fixtures/tables.toml");

    #[test]
    fn report_lists_entities_sorted() {
        let resolver = EntityResolver::from_toml_str(DEMO_MAPPING).unwrap();
        let report = mapping_report(&resolver).unwrap();
        let names: Vec<&str> = report.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Artist", "Exhibit", "Gallery", "Painting"]);
        assert_eq!(report.tables, 6);

        let painting = &report.entities[3];
        assert!(painting.optimistic);
        let artist = &report.entities[0];
        let exhibits = artist.relationships.iter().find(|r| r.name == "exhibitArray").unwrap();
        assert_eq!(exhibits.kind, "flattened");
    }

    #[test]
    fn report_reads_relationship_kinds() {
        let resolver = EntityResolver::from_toml_str(TABLES).unwrap();
        let report = mapping_report(&resolver).unwrap();
        let table2 = report.entities.iter().find(|e| e.name == "Table2").unwrap();
        assert_eq!(table2.relationships[0].kind, "to-one");
    }

    #[test]
    fn missing_mapping_file_is_reported() {
        let err = load_mapping("/nonexistent/strata-mapping.toml").unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }

    #[test]
    fn default_config_without_path() {
        assert_eq!(load_config(None).unwrap(), DomainConfig::default());
    }

    #[test]
    fn demo_runs_all_steps() {
        let steps = run_demo(DomainConfig::default()).unwrap();
        assert_eq!(steps.len(), 3);

        assert_eq!(steps[0].summary.inserted, 4);
        assert!(steps[0].summary.tables.iter().any(|t| t == "ARTIST_INFO"));

        assert_eq!(steps[1].summary.updated, 1);
        assert_eq!(steps[1].statements, vec!["UPDATE PAINTING (1 rows)"]);

        assert_eq!(steps[2].summary.deleted, 3);
        let last = steps[2].statements.last().unwrap();
        assert!(last.contains("ARTIST "), "artist row goes last: {last}");
    }
}
