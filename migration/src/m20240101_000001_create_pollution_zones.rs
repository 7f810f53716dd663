use sea_orm_migration::{prelude::*, schema::*};

/// Table holding the pollution-zone polygons, queried by the pollution matcher
pub const POLLUTION_ZONE_TABLE: &str = "berlin_polygons";

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("CREATE EXTENSION IF NOT EXISTS postgis;")
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(BerlinPolygons::Table)
                    .if_not_exists()
                    .col(pk_auto(BerlinPolygons::Id))
                    .col(
                        ColumnDef::new(BerlinPolygons::Outline)
                            .custom(Alias::new("GEOMETRY(POLYGON, 4326)"))
                            .not_null(),
                    )
                    // Severity 1..9, enforced by the check below
                    .col(integer(BerlinPolygons::Pollution))
                    .check(
                        Expr::col(BerlinPolygons::Pollution)
                            .gte(1)
                            .and(Expr::col(BerlinPolygons::Pollution).lte(9)),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .get_connection()
            .execute_unprepared(
                "CREATE INDEX IF NOT EXISTS idx_berlin_polygons_outline \
                 ON berlin_polygons USING GIST (outline);",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(BerlinPolygons::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum BerlinPolygons {
    Table,
    Id,
    Outline,
    Pollution,
}
