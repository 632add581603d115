//! CSV event readers and state writers used by the CLI.

pub mod ledger_reader;
pub mod reservation_reader;
pub mod summary_writer;

fn reader_builder() -> ::csv::ReaderBuilder {
    let mut builder = ::csv::ReaderBuilder::new();
    builder.trim(::csv::Trim::All).flexible(true);
    builder
}
