#![no_main]
use libfuzzer_sys::fuzz_target;

use airbnb_madrid::import::RowCleaner;

fuzz_target!(|data: &[u8]| {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(data);
    let Ok(headers) = reader.headers().cloned() else {
        return;
    };
    let cleaner = RowCleaner::new(true);
    for row in reader.records().flatten() {
        let _ = cleaner.clean(&headers, &row);
    }
});
