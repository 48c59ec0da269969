mod common;

use common::{captured_log, context, row_count, Currency};
use entity_dal::{
    ActivatableEntity, EntityOperations, EntityOperationsRepository, RepoError, SqliteContext,
};
use log::Level;

type CurrencyRepo = EntityOperationsRepository<Currency, SqliteContext>;

fn repo() -> CurrencyRepo {
    EntityOperationsRepository::new(context())
}

fn count(repo: &mut CurrencyRepo) -> i64 {
    row_count(repo.base().context().connection(), "currencies")
}

#[test]
fn save_upserts_by_code_instead_of_inserting_a_duplicate() {
    let mut repo = repo();
    let stored = repo.save(Currency::new("A", "First")).unwrap();
    assert!(stored.id > 0);

    let resaved = repo.save(Currency::new("A", "Renamed")).unwrap();

    assert_eq!(resaved.id, stored.id);
    assert_eq!(count(&mut repo), 1);
    let loaded = repo.get_by_id(&stored.id).unwrap().unwrap();
    assert_eq!(loaded.name, "Renamed");
    assert!(loaded.is_active);
}

#[test]
fn save_by_id_updates_a_fetched_and_modified_entity() {
    let mut repo = repo();
    let stored = repo.save(Currency::new("EUR", "Euro")).unwrap();

    let mut fetched = repo.get_by_id(&stored.id).unwrap().unwrap();
    fetched.code = "EUR2".to_string();
    repo.save_by_id(fetched).unwrap();

    assert_eq!(count(&mut repo), 1);
    let loaded = repo.get_by_id(&stored.id).unwrap().unwrap();
    assert_eq!(loaded.code, "EUR2");
}

#[test]
fn save_by_id_inserts_when_key_is_unknown() {
    let mut repo = repo();

    let inserted = repo.save_by_id(Currency::new("NOK", "Krone")).unwrap();

    assert!(inserted.id > 0);
    assert_eq!(count(&mut repo), 1);
}

#[test]
fn activate_then_deactivate_leaves_entity_inactive() {
    let mut repo = repo();
    let stored = repo.save(Currency::new("SEK", "Krona")).unwrap();

    repo.activate_by_id(&stored.id).unwrap();
    let deactivated = repo.deactivate_by_id(&stored.id).unwrap();
    assert!(!deactivated.is_active);

    let loaded = repo.get_by_id(&stored.id).unwrap().unwrap();
    assert!(!loaded.is_active);
}

#[test]
fn deactivate_then_activate_leaves_entity_active() {
    let mut repo = repo();
    let stored = repo.save(Currency::new("PLN", "Zloty")).unwrap();

    repo.deactivate_by_id(&stored.id).unwrap();
    let activated = repo.activate_by_id(&stored.id).unwrap();
    assert!(activated.is_active);

    let loaded = repo.get_by_id(&stored.id).unwrap().unwrap();
    assert!(loaded.is_active);
    assert_eq!(count(&mut repo), 1);
}

#[test]
fn activation_of_an_instance_updates_the_flag_in_place() {
    let mut repo = repo();
    let mut currency = repo.save(Currency::new("CZK", "Koruna")).unwrap();

    repo.deactivate(&mut currency).unwrap();
    assert!(!currency.is_active);
    assert!(!repo.get_by_id(&currency.id).unwrap().unwrap().is_active);

    repo.activate(&mut currency).unwrap();
    assert!(currency.is_active);
    assert!(repo.get_by_id(&currency.id).unwrap().unwrap().is_active);
}

#[test]
fn deactivate_by_missing_key_fails_with_not_found() {
    let mut repo = repo();

    let err = repo.deactivate_by_id(&77).unwrap_err();

    assert!(matches!(
        err,
        RepoError::NotFound { entity: "currencies", ref key } if key == "77"
    ));
}

#[test]
fn activate_by_missing_key_fails_with_not_found() {
    let mut repo = repo();
    assert!(matches!(
        repo.activate_by_id(&5).unwrap_err(),
        RepoError::NotFound { .. }
    ));
}

#[test]
fn delete_by_id_removes_row_and_fails_for_missing_key() {
    let mut repo = repo();
    let stored = repo.save(Currency::new("HUF", "Forint")).unwrap();

    repo.delete_by_id(&stored.id).unwrap();
    assert_eq!(count(&mut repo), 0);

    let err = repo.delete_by_id(&stored.id).unwrap_err();
    assert!(matches!(err, RepoError::NotFound { .. }));
}

#[test]
fn delete_removes_the_given_entity() {
    let mut repo = repo();
    let stored = repo.save(Currency::new("RON", "Leu")).unwrap();

    repo.delete(&stored).unwrap();

    assert!(repo.get_by_id(&stored.id).unwrap().is_none());
}

#[test]
fn base_repository_shares_the_same_context() {
    let mut repo = repo();
    repo.save(Currency::new("ISK", "Krona")).unwrap();
    repo.save(Currency::new("BGN", "Lev")).unwrap();

    let removed = repo
        .base()
        .delete_set(|row: &Currency| row.code == "ISK")
        .unwrap();

    assert_eq!(removed, 1);
    assert_eq!(count(&mut repo), 1);
}

#[test]
fn failed_lookup_is_logged_inside_the_operation_bracket() {
    let (capture, log) = captured_log();
    let mut repo: CurrencyRepo = EntityOperationsRepository::with_log(context(), log);

    repo.deactivate_by_id(&1).unwrap_err();

    let lines = capture.lines_for("deactivate_by_id");
    assert_eq!(lines.len(), 3);
    assert!(lines[0].1.contains("status=start"));
    assert_eq!(lines[1].0, Level::Error);
    assert!(lines[1].1.contains("currencies not found"));
    assert!(lines[2].1.contains("status=end"));
}
