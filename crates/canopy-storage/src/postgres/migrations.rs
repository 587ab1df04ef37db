use sqlx::PgPool;

use crate::traits::StorageError;

pub fn validate_schema_name(name: &str) -> Result<(), StorageError> {
    let is_valid = name.starts_with("tenant_")
        && name.len() == 39
        && name[7..].chars().all(|c| c.is_ascii_hexdigit());
    if !is_valid {
        return Err(StorageError::Internal(format!(
            "invalid tenant schema name: {name}"
        )));
    }
    Ok(())
}

pub async fn run_shared_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            name        TEXT NOT NULL UNIQUE,
            pg_schema   TEXT NOT NULL UNIQUE,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

const PERMISSION_CHECK: &str =
    "CHECK (permission IN ('no_access', 'read', 'feedback', 'write', 'admin'))";

pub async fn create_tenant_schema(pool: &PgPool, schema_name: &str) -> Result<(), StorageError> {
    validate_schema_name(schema_name)?;

    fn to_storage_error(e: sqlx::Error) -> StorageError {
        StorageError::Internal(e.to_string())
    }

    let statements = [
        format!("CREATE SCHEMA IF NOT EXISTS {schema_name}"),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema_name}.users (
                id          UUID PRIMARY KEY,
                name        TEXT NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema_name}.creatives (
                id          UUID PRIMARY KEY,
                parent_id   UUID REFERENCES {schema_name}.creatives(id) ON DELETE CASCADE,
                origin_id   UUID REFERENCES {schema_name}.creatives(id) ON DELETE CASCADE,
                owner_id    UUID NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_creatives_parent ON {schema_name}.creatives (parent_id)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_creatives_origin ON {schema_name}.creatives (origin_id)"
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema_name}.shares (
                id              UUID PRIMARY KEY,
                creative_id     UUID NOT NULL
                                REFERENCES {schema_name}.creatives(id) ON DELETE CASCADE,
                user_id         UUID REFERENCES {schema_name}.users(id) ON DELETE CASCADE,
                permission      TEXT NOT NULL {PERMISSION_CHECK},
                shared_by_id    UUID NOT NULL,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE NULLS NOT DISTINCT (creative_id, user_id)
            )
            "#
        ),
        // No foreign keys: rows outliving their creative, user or share are
        // what the sweep collects.
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {schema_name}.permission_cache (
                id              BIGSERIAL PRIMARY KEY,
                creative_id     UUID NOT NULL,
                user_id         UUID,
                permission      TEXT NOT NULL {PERMISSION_CHECK},
                source_share_id UUID,
                updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE NULLS NOT DISTINCT (creative_id, user_id)
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_permission_cache_user \
             ON {schema_name}.permission_cache (user_id)"
        ),
    ];

    for statement in &statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(to_storage_error)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_tenant_schema_names() {
        for name in [
            "tenant_00000000000000000000000000000000",
            "tenant_a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6",
        ] {
            assert!(validate_schema_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_anything_else() {
        for name in [
            "tenant_; DROP TABLE users; --",
            "public",
            "schema_00000000000000000000000000000000",
            "tenant_abc",
            "tenant_0000000000000000000000000000000g",
            "tenant_000000000000000000000000000000000",
        ] {
            assert!(validate_schema_name(name).is_err(), "{name}");
        }
    }
}
