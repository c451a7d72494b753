// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! V8 platform initialization. Process-wide, happens exactly once, before
//! any isolate is created.

use std::sync::{Mutex, Once};

use lazy_static::lazy_static;

static V8_INIT: Once = Once::new();

lazy_static! {
    static ref V8_PLATFORM: Mutex<Option<v8::SharedRef<v8::Platform>>> = Mutex::new(None);
}

/// Initialize the V8 platform. Safe to call repeatedly; initialization
/// happens only once.
pub fn initialize_v8() {
    V8_INIT.call_once(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();

        let mut guard = V8_PLATFORM.lock().unwrap();
        *guard = Some(platform);
    });
}
