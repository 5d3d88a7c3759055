//! Statement text for the table manager's commands

use crate::error::RowParseError;
use crate::schema::TableDescriptor;
use pgmirror_api::MirroredItem;

pub fn select_query(desc: &TableDescriptor) -> String {
    format!("SELECT * FROM {};", desc.qualified_name())
}

pub fn insert_query(desc: &TableDescriptor, item: &MirroredItem) -> Result<String, RowParseError> {
    let columns = desc.item_to_columns(item)?;
    let mut names: Vec<&str> = columns.iter().map(|(name, _)| name.as_str()).collect();
    let mut values: Vec<&str> = columns.iter().map(|(_, lit)| lit.as_str()).collect();
    let id = desc.identity_literal(item.id());
    names.push(desc.identity_field());
    values.push(&id);

    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({});",
        desc.qualified_name(),
        names.join(", "),
        values.join(", ")
    ))
}

pub fn update_query(desc: &TableDescriptor, item: &MirroredItem) -> Result<String, RowParseError> {
    let id = desc.identity_literal(item.id());
    let mut assignments: Vec<String> = desc
        .item_to_columns(item)?
        .into_iter()
        .map(|(name, lit)| format!("{}={}", name, lit))
        .collect();
    if assignments.is_empty() {
        // nothing mirrored besides the identity
        assignments.push(format!("{}={}", desc.identity_field(), id));
    }

    Ok(format!(
        "UPDATE {} SET {} WHERE {}={};",
        desc.qualified_name(),
        assignments.join(", "),
        desc.identity_field(),
        id
    ))
}

pub fn delete_query(desc: &TableDescriptor, id: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {}={};",
        desc.qualified_name(),
        desc.identity_field(),
        desc.identity_literal(id)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;

    fn desc() -> TableDescriptor {
        TableDescriptor::new("public", "users")
            .field("login", FieldType::String)
            .field("age", FieldType::Integer)
    }

    fn item() -> MirroredItem {
        MirroredItem::with_id("{5}")
            .with("login", "o'neil")
            .with("age", 40i64)
    }

    #[test]
    fn test_select() {
        assert_eq!(select_query(&desc()), "SELECT * FROM public.users;");
    }

    #[test]
    fn test_insert() {
        assert_eq!(
            insert_query(&desc(), &item()).unwrap(),
            "INSERT INTO public.users (login, age, _uuid) VALUES ('o''neil', 40, '5');"
        );
    }

    #[test]
    fn test_update() {
        assert_eq!(
            update_query(&desc(), &item()).unwrap(),
            "UPDATE public.users SET login='o''neil', age=40 WHERE _uuid='5';"
        );
    }

    #[test]
    fn test_delete() {
        assert_eq!(
            delete_query(&desc(), "5"),
            "DELETE FROM public.users WHERE _uuid='5';"
        );
    }

    #[test]
    fn test_missing_optional_field_is_null() {
        let item = MirroredItem::with_id("1").with("login", "x");
        assert_eq!(
            insert_query(&desc(), &item).unwrap(),
            "INSERT INTO public.users (login, age, _uuid) VALUES ('x', NULL, '1');"
        );
    }
}
