#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data)
        && let Ok(pipeline) = airbnb_madrid::domain::pipeline::Pipeline::from_json(text)
    {
        let _ = pipeline.to_documents();
    }
});
